//! The agent loop: drives LLM turns and dispatches tool calls through the
//! safety harness and the universal executor.

pub mod hook_runner;
pub mod provider;
pub mod r#loop;

pub use hook_runner::{DirectiveHookRunner, DirectiveResolver};
pub use provider::{
    AnthropicClient, ChatMessage, ChatRole, ContentBlock, ModelClient, ModelError, ModelResponse,
    ToolSpec,
};
pub use r#loop::{AgentLoop, AgentTool, COMPLETION_MARKER, LoopResult};

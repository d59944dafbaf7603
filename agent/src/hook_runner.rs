//! Runs hook directives as child agent threads.
//!
//! The harness hands over an attenuated token and templated inputs; this
//! runner resolves the hook directive, adopts a child harness around the
//! token, and drives a child loop. The hook's returned action is read from
//! its final text.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use kiwi_executor::UniversalExecutor;
use kiwi_capability::CapabilityToken;
use kiwi_harness::{HarnessShared, HookRunError, HookRunner, SafetyHarness};
use kiwi_types::{DirectiveSpec, HookAction, ThreadId};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::provider::ModelClient;
use crate::r#loop::AgentLoop;

/// Looks a hook directive up by name. Directive files themselves are an
/// external collaborator; the kernel only consumes the resolved spec.
pub trait DirectiveResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<DirectiveSpec>;
}

/// The standard hook runner: each hook directive becomes a child thread
/// with its own harness and loop.
pub struct DirectiveHookRunner {
    resolver: Arc<dyn DirectiveResolver>,
    client: Arc<dyn ModelClient>,
    executor: Arc<UniversalExecutor>,
    /// Set after construction; `HarnessShared` holds the runner, so the
    /// reference is installed once both exist.
    shared: OnceLock<HarnessShared>,
}

impl DirectiveHookRunner {
    #[must_use]
    pub fn new(
        resolver: Arc<dyn DirectiveResolver>,
        client: Arc<dyn ModelClient>,
        executor: Arc<UniversalExecutor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            resolver,
            client,
            executor,
            shared: OnceLock::new(),
        })
    }

    /// Wire the shared collaborators in after the `HarnessShared` exists.
    pub fn install(&self, shared: HarnessShared) {
        let _ = self.shared.set(shared);
    }
}

/// A hook's action comes back as JSON (`{"action": "retry"}`) anywhere in
/// its final text; absent or unparseable means `continue`.
fn parse_action(text: &str) -> HookAction {
    if let Ok(value) = serde_json::from_str::<Value>(text.trim())
        && let Some(action) = value.get("action")
        && let Ok(action) = serde_json::from_value::<HookAction>(action.clone())
    {
        return action;
    }
    for line in text.lines().rev() {
        if let Ok(value) = serde_json::from_str::<Value>(line.trim())
            && let Some(action) = value.get("action")
            && let Ok(action) = serde_json::from_value::<HookAction>(action.clone())
        {
            return action;
        }
    }
    HookAction::Continue
}

#[async_trait]
impl HookRunner for DirectiveHookRunner {
    async fn run_hook(
        &self,
        directive: &str,
        inputs: Value,
        token: CapabilityToken,
        parent: ThreadId,
        depth: u32,
    ) -> Result<HookAction, HookRunError> {
        let spec = self
            .resolver
            .resolve(directive)
            .ok_or_else(|| HookRunError::new(format!("no hook directive named '{directive}'")))?;
        let shared = self
            .shared
            .get()
            .ok_or_else(|| HookRunError::new("hook runner not installed"))?;

        let harness = SafetyHarness::adopt(
            spec,
            shared.clone(),
            token,
            Some(parent),
            CancellationToken::new(),
            depth,
        )
        .map_err(|e| HookRunError::new(e.to_string()))?;

        debug!(directive, depth, "running hook directive as child thread");
        let agent = AgentLoop::new(harness, self.executor.clone(), self.client.clone());
        let initial = serde_json::to_string(&inputs)
            .map_err(|e| HookRunError::new(format!("inputs serialization: {e}")))?;
        let result = agent
            .run(&initial)
            .await
            .map_err(|e| HookRunError::new(e.to_string()))?;
        Ok(parse_action(&result.text))
    }
}

//! The per-thread turn loop.
//!
//! Each turn: `before_step` checkpoint, model call, cost update,
//! `after_step` checkpoint, then tool dispatch through the capability check
//! and the universal executor. Tools exposed to the model are filtered by
//! the thread's capability token.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use kiwi_executor::{ExecutorError, UniversalExecutor};
use kiwi_harness::{CheckpointOutcome, FinalReport, SafetyHarness, ThreadStatus};
use kiwi_types::{CheckpointName, Event, HookAction};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::provider::{ChatMessage, ChatRole, ContentBlock, ModelClient, ModelResponse, ToolSpec};

/// A text-only turn containing this marker ends the thread successfully.
pub const COMPLETION_MARKER: &str = "[[complete]]";

/// Model used when the directive declares none.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5";

const PAUSE_POLL: Duration = Duration::from_millis(50);

/// A tool the loop can offer to the model.
#[derive(Debug, Clone)]
pub struct AgentTool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    /// On-disk tool the executor resolves and runs.
    pub path: PathBuf,
    /// Capability required to call it, e.g. `tool.echo`.
    pub capability: String,
}

/// What a finished thread hands back to its caller.
#[derive(Debug, Clone)]
pub struct LoopResult {
    pub report: FinalReport,
    pub text: String,
}

/// Drives one thread's turns.
pub struct AgentLoop {
    harness: SafetyHarness,
    executor: Arc<UniversalExecutor>,
    client: Arc<dyn ModelClient>,
    model: String,
    system_prompt: Option<String>,
    tools: Vec<AgentTool>,
    messages: Vec<ChatMessage>,
}

impl AgentLoop {
    #[must_use]
    pub fn new(
        harness: SafetyHarness,
        executor: Arc<UniversalExecutor>,
        client: Arc<dyn ModelClient>,
    ) -> Self {
        let model = harness
            .directive()
            .model
            .clone()
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        Self {
            harness,
            executor,
            client,
            model,
            system_prompt: None,
            tools: Vec::new(),
            messages: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    #[must_use]
    pub fn with_tool(mut self, tool: AgentTool) -> Self {
        self.tools.push(tool);
        self
    }

    #[must_use]
    pub fn harness(&self) -> &SafetyHarness {
        &self.harness
    }

    /// Tools the active token actually covers.
    fn visible_tools(&self) -> Vec<ToolSpec> {
        self.tools
            .iter()
            .filter(|tool| self.harness.check_capability(&tool.capability).is_ok())
            .map(|tool| ToolSpec {
                name: tool.name.clone(),
                description: tool.description.clone(),
                input_schema: tool.input_schema.clone(),
            })
            .collect()
    }

    /// Run to completion, starting from `initial_message`.
    pub async fn run(mut self, initial_message: &str) -> anyhow::Result<LoopResult> {
        self.messages.push(ChatMessage::user_text(initial_message));
        let mut last_event: Option<Event> = None;
        let mut last_text = String::new();

        loop {
            if self.harness.cancel_token().is_cancelled() {
                return self.conclude(ThreadStatus::Aborted, Some("cancelled".into()), last_event, last_text);
            }
            self.wait_while_paused().await?;
            if self.harness.cancel_token().is_cancelled() {
                return self.conclude(ThreadStatus::Aborted, Some("cancelled".into()), last_event, last_text);
            }
            self.absorb_injected_messages()?;

            let before = self.harness.checkpoint(CheckpointName::BeforeStep, None).await;
            remember(&mut last_event, &before);
            match before.action {
                HookAction::Abort => {
                    return self.conclude(ThreadStatus::Aborted, None, last_event, last_text);
                }
                HookAction::Fail => {
                    return self.conclude(
                        ThreadStatus::Failed,
                        last_event.as_ref().map(|e| e.code.clone()),
                        last_event,
                        last_text,
                    );
                }
                HookAction::Retry | HookAction::Continue | HookAction::Skip => {}
            }

            let tools = self.visible_tools();
            let response = match self
                .client
                .complete(&self.model, self.system_prompt.as_deref(), &self.messages, &tools)
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    let event = Event::new(
                        CheckpointName::Error,
                        "model_error",
                        json!({ "message": e.to_string() }),
                    );
                    let outcome = self
                        .harness
                        .checkpoint(CheckpointName::Error, Some(event.clone()))
                        .await;
                    last_event = Some(event);
                    match outcome.action {
                        HookAction::Retry => continue,
                        HookAction::Abort => {
                            return self.conclude(ThreadStatus::Aborted, Some(e.to_string()), last_event, last_text);
                        }
                        _ => {
                            return self.conclude(ThreadStatus::Failed, Some(e.to_string()), last_event, last_text);
                        }
                    }
                }
            };

            let text = response.text();
            self.harness
                .update_cost_after_turn(response.usage, &self.model, &text);
            self.messages.push(ChatMessage {
                role: ChatRole::Assistant,
                content: content_value(&response),
            });

            let after = self.harness.checkpoint(CheckpointName::AfterStep, None).await;
            remember(&mut last_event, &after);
            let mut skip_dispatch = false;
            match after.action {
                HookAction::Abort => {
                    return self.conclude(ThreadStatus::Aborted, None, last_event, last_text);
                }
                HookAction::Fail => {
                    return self.conclude(
                        ThreadStatus::Failed,
                        last_event.as_ref().map(|e| e.code.clone()),
                        last_event,
                        last_text,
                    );
                }
                HookAction::Retry => {
                    // Redo the turn: drop the assistant message just added.
                    self.messages.pop();
                    continue;
                }
                HookAction::Skip => skip_dispatch = true,
                HookAction::Continue => {}
            }

            let tool_uses: Vec<(String, String, Value)> = response
                .tool_uses()
                .into_iter()
                .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
                .collect();

            if tool_uses.is_empty() {
                last_text = text;
                // A completion marker or a structured final object ends the
                // thread; plain prose lets the model keep going.
                let structured = serde_json::from_str::<Value>(last_text.trim())
                    .map(|v| v.is_object())
                    .unwrap_or(false);
                if last_text.contains(COMPLETION_MARKER) || structured {
                    return self.conclude(ThreadStatus::Succeeded, None, last_event, last_text);
                }
                self.messages.push(ChatMessage::user_text("continue"));
                continue;
            }

            let mut results: Vec<Value> = Vec::with_capacity(tool_uses.len());
            for (id, name, input) in tool_uses {
                if skip_dispatch {
                    results.push(tool_result(&id, json!("skipped"), false));
                    continue;
                }
                match self.dispatch(&id, &name, input, &mut last_event).await? {
                    Dispatched::Result(block) => results.push(block),
                    Dispatched::Terminal(status, error) => {
                        return self.conclude(status, error, last_event, last_text);
                    }
                }
            }
            self.messages.push(ChatMessage {
                role: ChatRole::User,
                content: Value::Array(results),
            });
        }
    }

    async fn dispatch(
        &mut self,
        call_id: &str,
        name: &str,
        input: Value,
        last_event: &mut Option<Event>,
    ) -> anyhow::Result<Dispatched> {
        let Some(tool) = self.tools.iter().find(|t| t.name == name).cloned() else {
            warn!(tool = name, "model called an unknown tool");
            return Ok(Dispatched::Result(tool_result(
                call_id,
                json!({ "error": format!("unknown tool '{name}'") }),
                true,
            )));
        };

        if let Err(event) = self.harness.check_capability(&tool.capability) {
            let outcome = self
                .harness
                .checkpoint(CheckpointName::Limit, Some(event.clone()))
                .await;
            *last_event = Some(event);
            return Ok(match outcome.action {
                HookAction::Abort => Dispatched::Terminal(ThreadStatus::Aborted, None),
                HookAction::Fail => Dispatched::Terminal(
                    ThreadStatus::Failed,
                    Some("permission_denied".to_string()),
                ),
                _ => Dispatched::Result(tool_result(
                    call_id,
                    json!({ "error": format!("capability '{}' denied", tool.capability) }),
                    true,
                )),
            });
        }

        debug!(tool = name, "dispatching tool call");
        match self
            .executor
            .execute(&tool.path, input, self.harness.cancel_token())
            .await
        {
            Ok(outcome) => {
                if !outcome.success() {
                    let event = Event::new(
                        CheckpointName::Error,
                        "primitive_failed",
                        json!({
                            "tool": name,
                            "error": outcome.error_summary(),
                        }),
                    );
                    let checkpoint = self
                        .harness
                        .checkpoint(CheckpointName::Error, Some(event.clone()))
                        .await;
                    *last_event = Some(event);
                    match checkpoint.action {
                        HookAction::Abort => {
                            return Ok(Dispatched::Terminal(ThreadStatus::Aborted, None));
                        }
                        HookAction::Fail => {
                            return Ok(Dispatched::Terminal(
                                ThreadStatus::Failed,
                                outcome.error_summary(),
                            ));
                        }
                        _ => {}
                    }
                }
                let failed = !outcome.success();
                Ok(Dispatched::Result(tool_result(
                    call_id,
                    outcome.to_value(),
                    failed,
                )))
            }
            // Fatal to this execution, not to the thread.
            Err(e) => {
                let event = Event::new(
                    CheckpointName::Error,
                    error_code(&e),
                    json!({ "tool": name, "message": e.to_string() }),
                );
                let checkpoint = self
                    .harness
                    .checkpoint(CheckpointName::Error, Some(event.clone()))
                    .await;
                *last_event = Some(event);
                match checkpoint.action {
                    HookAction::Abort => Ok(Dispatched::Terminal(ThreadStatus::Aborted, None)),
                    HookAction::Fail => {
                        Ok(Dispatched::Terminal(ThreadStatus::Failed, Some(e.to_string())))
                    }
                    _ => Ok(Dispatched::Result(tool_result(
                        call_id,
                        json!({ "error": e.to_string() }),
                        true,
                    ))),
                }
            }
        }
    }

    async fn wait_while_paused(&self) -> anyhow::Result<()> {
        loop {
            let record = self
                .harness
                .registry()
                .get(self.harness.thread_id())
                .context("reading thread record")?;
            match record {
                Some(record) if record.status == ThreadStatus::Paused => {
                    if self.harness.cancel_token().is_cancelled() {
                        return Ok(());
                    }
                    tokio::time::sleep(PAUSE_POLL).await;
                }
                _ => return Ok(()),
            }
        }
    }

    fn absorb_injected_messages(&mut self) -> anyhow::Result<()> {
        let injected = self
            .harness
            .registry()
            .drain_messages(self.harness.thread_id())
            .context("draining injected messages")?;
        for message in injected {
            debug!(thread = %self.harness.thread_id(), "absorbing injected message");
            self.messages.push(ChatMessage::user_text(&message));
        }
        Ok(())
    }

    fn conclude(
        self,
        status: ThreadStatus,
        error: Option<String>,
        last_event: Option<Event>,
        text: String,
    ) -> anyhow::Result<LoopResult> {
        self.harness.finish(status)?;
        let report = self.harness.final_report(status, error, last_event);
        Ok(LoopResult { report, text })
    }
}

enum Dispatched {
    Result(Value),
    Terminal(ThreadStatus, Option<String>),
}

fn remember(last_event: &mut Option<Event>, outcome: &CheckpointOutcome) {
    if let Some(event) = &outcome.event {
        *last_event = Some(event.clone());
    }
}

fn tool_result(call_id: &str, content: Value, is_error: bool) -> Value {
    // Result text enters the LLM transcript: best-effort secret hygiene.
    let content = kiwi_utils::redact_secrets(&content.to_string());
    json!({
        "type": "tool_result",
        "tool_use_id": call_id,
        "content": content,
        "is_error": is_error,
    })
}

fn content_value(response: &ModelResponse) -> Value {
    let blocks: Vec<Value> = response
        .content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(json!({ "type": "text", "text": text })),
            ContentBlock::ToolUse { id, name, input } => Some(json!({
                "type": "tool_use",
                "id": id,
                "name": name,
                "input": input,
            })),
            ContentBlock::Unknown => None,
        })
        .collect();
    Value::Array(blocks)
}

fn error_code(error: &ExecutorError) -> &'static str {
    match error.failure_kind() {
        kiwi_types::FailureKind::Integrity => "integrity_error",
        kiwi_types::FailureKind::LockfileStale => "lockfile_stale",
        kiwi_types::FailureKind::ExecutorNotFound => "executor_not_found",
        kiwi_types::FailureKind::ChainTooDeep => "chain_too_deep",
        kiwi_types::FailureKind::ChainInvalid => "chain_invalid",
        kiwi_types::FailureKind::SchemaValidation => "schema_validation",
        kiwi_types::FailureKind::Timeout => "timeout",
        _ => "execution_error",
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use kiwi_executor::{ExecutorOptions, UniversalExecutor};
    use kiwi_harness::{HarnessShared, HookRunError, HookRunner, SafetyHarness, ThreadRegistry, ThreadStatus};
    use kiwi_capability::{CapabilityToken, TokenSigner};
    use kiwi_telemetry::TelemetryStore;
    use kiwi_tools::ToolRoots;
    use kiwi_types::{
        DirectiveSpec, HookAction, Limits, PermissionAction, PermissionSpec, PricingTable,
        ThreadId, TurnUsage,
    };
    use serde_json::{Value, json};

    use super::{AgentLoop, AgentTool, COMPLETION_MARKER, LoopResult};
    use crate::provider::{ChatMessage, ContentBlock, ModelClient, ModelError, ModelResponse, ToolSpec};

    /// Plays back scripted responses and records what it was asked.
    struct ScriptedClient {
        responses: Mutex<Vec<ModelResponse>>,
        seen_tools: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedClient {
        fn new(responses: Vec<ModelResponse>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                seen_tools: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedClient {
        async fn complete(
            &self,
            _model: &str,
            _system: Option<&str>,
            _messages: &[ChatMessage],
            tools: &[ToolSpec],
        ) -> Result<ModelResponse, ModelError> {
            self.seen_tools
                .lock()
                .unwrap()
                .push(tools.iter().map(|t| t.name.clone()).collect());
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(ModelError::Transport("script exhausted".to_string()));
            }
            Ok(responses.remove(0))
        }
    }

    struct NoopHooks;

    #[async_trait]
    impl HookRunner for NoopHooks {
        async fn run_hook(
            &self,
            _directive: &str,
            _inputs: Value,
            _token: CapabilityToken,
            _parent: ThreadId,
            _depth: u32,
        ) -> Result<HookAction, HookRunError> {
            Ok(HookAction::Continue)
        }
    }

    fn text_response(text: &str) -> ModelResponse {
        ModelResponse {
            content: vec![ContentBlock::Text {
                text: text.to_string(),
            }],
            usage: Some(TurnUsage::from_provider(Some(50), Some(10), None)),
            stop_reason: Some("end_turn".to_string()),
        }
    }

    fn tool_call_response(name: &str, input: Value) -> ModelResponse {
        ModelResponse {
            content: vec![ContentBlock::ToolUse {
                id: "toolu_1".to_string(),
                name: name.to_string(),
                input,
            }],
            usage: Some(TurnUsage::from_provider(Some(80), Some(20), None)),
            stop_reason: Some("tool_use".to_string()),
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        executor: Arc<UniversalExecutor>,
        shared: HarnessShared,
        tool_path: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let user_scope = dir.path().join(".kiwi");
            fs::create_dir_all(user_scope.join("tools")).unwrap();
            let tool_path = user_scope.join("tools/echo.py");
            fs::write(
                &tool_path,
                "# tool_type: primitive\n\
                 # executor_id: null\n\
                 # category: demo\n\
                 # version: 1.0.0\n\
                 # config: {\"command\": \"echo\", \"args\": [\"hello\"]}\n",
            )
            .unwrap();

            let roots = ToolRoots::new(None, user_scope.clone());
            let executor = Arc::new(UniversalExecutor::new(
                roots,
                TelemetryStore::at_user_scope(&user_scope, true),
                ExecutorOptions::default(),
            ));
            let shared = HarnessShared {
                signer: Arc::new(TokenSigner::generate()),
                registry: Arc::new(ThreadRegistry::at_user_scope(&user_scope)),
                pricing: PricingTable::builtin(),
                hook_runner: Arc::new(NoopHooks),
            };
            Self {
                _dir: dir,
                executor,
                shared,
                tool_path,
            }
        }

        fn directive(&self, permissions: Vec<PermissionSpec>, limits: Limits) -> DirectiveSpec {
            DirectiveSpec {
                id: "root".into(),
                model: None,
                permissions,
                limits,
                hooks: Vec::new(),
            }
        }

        fn echo_tool(&self) -> AgentTool {
            AgentTool {
                name: "echo".to_string(),
                description: "echo a greeting".to_string(),
                input_schema: json!({"type": "object"}),
                path: self.tool_path.clone(),
                capability: "tool.echo".to_string(),
            }
        }

        fn agent(&self, directive: DirectiveSpec, client: Arc<dyn ModelClient>) -> AgentLoop {
            let harness = SafetyHarness::start(directive, self.shared.clone()).unwrap();
            AgentLoop::new(harness, self.executor.clone(), client).with_tool(self.echo_tool())
        }
    }

    fn exec_tool_perm() -> PermissionSpec {
        PermissionSpec {
            action: PermissionAction::Execute,
            resource: "tool".to_string(),
            id: Some("echo".to_string()),
        }
    }

    #[tokio::test]
    async fn text_with_marker_completes_the_thread() {
        let fixture = Fixture::new();
        let client = ScriptedClient::new(vec![text_response(&format!(
            "all done {COMPLETION_MARKER}"
        ))]);
        let agent = fixture.agent(
            fixture.directive(vec![exec_tool_perm()], Limits::unbounded()),
            client,
        );

        let LoopResult { report, text } = agent.run("do the thing").await.unwrap();
        assert_eq!(report.status, ThreadStatus::Succeeded);
        assert!(text.contains("all done"));
        assert_eq!(report.cost.turns, 1);
        assert_eq!(report.cost.tokens_total, 60);
    }

    #[tokio::test]
    async fn tool_call_round_trips_through_the_executor() {
        let fixture = Fixture::new();
        let client = ScriptedClient::new(vec![
            tool_call_response("echo", json!({})),
            text_response(&format!("saw the output {COMPLETION_MARKER}")),
        ]);
        let agent = fixture.agent(
            fixture.directive(vec![exec_tool_perm()], Limits::unbounded()),
            client.clone(),
        );

        let LoopResult { report, .. } = agent.run("run echo").await.unwrap();
        assert_eq!(report.status, ThreadStatus::Succeeded);
        assert_eq!(report.cost.turns, 2);
        // The tool was offered to the model on both turns.
        assert_eq!(
            *client.seen_tools.lock().unwrap(),
            vec![vec!["echo".to_string()], vec!["echo".to_string()]]
        );
    }

    #[tokio::test]
    async fn tools_are_filtered_by_capability() {
        let fixture = Fixture::new();
        let client = ScriptedClient::new(vec![text_response(&format!(
            "nothing to do {COMPLETION_MARKER}"
        ))]);
        // Directive grants only fs.read: echo's tool.echo capability is
        // absent, so the model never sees the tool.
        let agent = fixture.agent(
            fixture.directive(
                vec![PermissionSpec {
                    action: PermissionAction::Read,
                    resource: "filesystem".to_string(),
                    id: None,
                }],
                Limits::unbounded(),
            ),
            client.clone(),
        );

        agent.run("hello").await.unwrap();
        assert_eq!(*client.seen_tools.lock().unwrap(), vec![Vec::<String>::new()]);
    }

    #[tokio::test]
    async fn denied_tool_call_fails_the_thread_by_default() {
        let fixture = Fixture::new();
        let client = ScriptedClient::new(vec![tool_call_response("echo", json!({}))]);
        let agent = fixture.agent(
            fixture.directive(
                vec![PermissionSpec {
                    action: PermissionAction::Read,
                    resource: "filesystem".to_string(),
                    id: None,
                }],
                Limits::unbounded(),
            ),
            client,
        );

        let LoopResult { report, .. } = agent.run("force the call").await.unwrap();
        assert_eq!(report.status, ThreadStatus::Failed);
        let event = report.last_event.expect("permission event");
        assert_eq!(event.code, "permission_denied");
        assert_eq!(event.detail["missing"], "tool.echo");
    }

    #[tokio::test]
    async fn turn_limit_ends_the_loop() {
        let fixture = Fixture::new();
        // Endless chatter, never a marker.
        let client = ScriptedClient::new(vec![
            text_response("thinking"),
            text_response("still thinking"),
            text_response("more thinking"),
        ]);
        let agent = fixture.agent(
            fixture.directive(
                vec![exec_tool_perm()],
                Limits {
                    turns: Some(2),
                    ..Limits::unbounded()
                },
            ),
            client,
        );

        let LoopResult { report, .. } = agent.run("go").await.unwrap();
        assert_eq!(report.status, ThreadStatus::Failed);
        assert_eq!(report.cost.turns, 2);
        assert_eq!(report.last_event.unwrap().code, "turns_exceeded");
    }

    #[tokio::test]
    async fn injected_messages_reach_the_transcript() {
        let fixture = Fixture::new();
        let client = ScriptedClient::new(vec![text_response(&format!(
            "ok {COMPLETION_MARKER}"
        ))]);
        let harness = SafetyHarness::start(
            fixture.directive(vec![exec_tool_perm()], Limits::unbounded()),
            fixture.shared.clone(),
        )
        .unwrap();
        let thread_id = harness.thread_id();
        fixture
            .shared
            .registry
            .inject_message(thread_id, "also check the logs")
            .unwrap();

        let agent = AgentLoop::new(harness, fixture.executor.clone(), client)
            .with_tool(fixture.echo_tool());
        let LoopResult { report, .. } = agent.run("start").await.unwrap();
        assert_eq!(report.status, ThreadStatus::Succeeded);
        // The injected message was drained into the transcript.
        assert!(
            fixture
                .shared
                .registry
                .get(thread_id)
                .unwrap()
                .unwrap()
                .injected_messages
                .is_empty()
        );
    }
}

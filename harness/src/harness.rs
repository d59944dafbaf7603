//! Checkpoints, limit enforcement, and hook dispatch.
//!
//! The harness wraps a thread's execution with four checkpoints. At each
//! one it enforces the hardcoded limits first, then evaluates the user's
//! hooks in declared order (first match wins), and runs the matched hook's
//! directive as a child thread holding an attenuated token.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use kiwi_capability::{CapabilityToken, TokenError, TokenSigner};
use kiwi_types::{
    Capability, CheckpointName, CostSnapshot, DirectiveSpec, Event, HookAction, LimitCode,
    PricingTable, ThreadId, TurnUsage,
};
use serde_json::{Value, json};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cost::CostLedger;
use crate::hooks::{CompiledHook, HookCompileError, compile_hooks, first_match};
use crate::registry::{ThreadRegistry, ThreadRegistryError, ThreadStatus};

/// Audience bound into every capability token this harness mints.
pub const AUDIENCE: &str = "kiwi-kernel";

/// Hooks may trigger hooks at most this deep.
pub const MAX_HOOK_DEPTH: u32 = 4;

/// Tokens outlive any reasonable thread, not the process.
const TOKEN_TTL_HOURS: i64 = 24;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    HookCompile(#[from] HookCompileError),
    #[error(transparent)]
    Registry(#[from] ThreadRegistryError),
    #[error("spawn budget exhausted: {current} of {max}")]
    SpawnBudget { current: u64, max: u64 },
}

/// Failure from executing a hook directive.
#[derive(Debug, Error)]
#[error("hook directive failed: {message}")]
pub struct HookRunError {
    pub message: String,
}

impl HookRunError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Executes a hook directive as a child thread.
///
/// The harness hands over the templated inputs and an already-attenuated
/// token; the runner owns resolving the directive and driving its turns.
#[async_trait]
pub trait HookRunner: Send + Sync {
    async fn run_hook(
        &self,
        directive: &str,
        inputs: Value,
        token: CapabilityToken,
        parent: ThreadId,
        depth: u32,
    ) -> Result<HookAction, HookRunError>;
}

/// Process-wide collaborators shared by every harness.
#[derive(Clone)]
pub struct HarnessShared {
    pub signer: Arc<TokenSigner>,
    pub registry: Arc<ThreadRegistry>,
    pub pricing: PricingTable,
    pub hook_runner: Arc<dyn HookRunner>,
}

impl std::fmt::Debug for HarnessShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HarnessShared")
            .field("signer", &self.signer)
            .field("registry", &self.registry)
            .field("pricing", &self.pricing)
            .finish_non_exhaustive()
    }
}

/// What a checkpoint decided.
#[derive(Debug, Clone)]
pub struct CheckpointOutcome {
    pub action: HookAction,
    pub event: Option<Event>,
}

/// The structured final object a thread reports when it ends.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FinalReport {
    pub status: ThreadStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub cost: CostSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event: Option<Event>,
}

/// The reentrant enforcement layer wrapping one thread.
#[derive(Debug)]
pub struct SafetyHarness {
    shared: HarnessShared,
    thread_id: ThreadId,
    directive: DirectiveSpec,
    hooks: Vec<CompiledHook>,
    ledger: CostLedger,
    token: CapabilityToken,
    cancel: CancellationToken,
    hook_depth: u32,
}

impl SafetyHarness {
    /// Start a root thread: mint its token from the directive's declared
    /// permissions and register it.
    pub fn start(directive: DirectiveSpec, shared: HarnessShared) -> Result<Self, HarnessError> {
        let thread_id = ThreadId::new();
        let token = shared.signer.mint(
            &directive.permissions,
            AUDIENCE,
            Utc::now() + Duration::hours(TOKEN_TTL_HOURS),
            directive.id.clone(),
            thread_id,
        )?;
        Self::build(
            directive,
            shared,
            thread_id,
            token,
            None,
            CancellationToken::new(),
            0,
        )
    }

    /// Spawn a child thread. The spawn budget is enforced on the parent
    /// before the child launches; the child's token is the intersection of
    /// the parent's with the child directive's declared permissions.
    pub fn spawn_child(&mut self, directive: DirectiveSpec) -> Result<SafetyHarness, HarnessError> {
        self.enforce_spawn_budget()?;
        self.ledger.note_spawn();
        let _ = self
            .shared
            .registry
            .update_usage(self.thread_id, self.ledger.snapshot());

        let thread_id = ThreadId::new();
        let token = self.shared.signer.attenuate(
            &self.token,
            &directive.permissions,
            directive.id.clone(),
            thread_id,
        )?;
        Self::build(
            directive,
            self.shared.clone(),
            thread_id,
            token,
            Some(self.thread_id),
            self.cancel.child_token(),
            self.hook_depth,
        )
    }

    /// Build a harness around an externally attenuated token, as used for
    /// hook directive threads. The token's own thread id becomes the
    /// harness's identity.
    pub fn adopt(
        directive: DirectiveSpec,
        shared: HarnessShared,
        token: CapabilityToken,
        parent: Option<ThreadId>,
        cancel: CancellationToken,
        hook_depth: u32,
    ) -> Result<Self, HarnessError> {
        let thread_id = token.peek()?.thread_id;
        Self::build(directive, shared, thread_id, token, parent, cancel, hook_depth)
    }

    fn build(
        directive: DirectiveSpec,
        shared: HarnessShared,
        thread_id: ThreadId,
        token: CapabilityToken,
        parent: Option<ThreadId>,
        cancel: CancellationToken,
        hook_depth: u32,
    ) -> Result<Self, HarnessError> {
        let hooks = compile_hooks(&directive.hooks)?;
        shared.registry.register(
            thread_id,
            directive.id.clone(),
            directive.limits.clone(),
            parent,
        )?;
        shared.registry.set_status(thread_id, ThreadStatus::Running)?;
        debug!(thread = %thread_id, directive = %directive.id, "harness started");
        Ok(Self {
            ledger: CostLedger::new(shared.pricing.clone()),
            shared,
            thread_id,
            directive,
            hooks,
            token,
            cancel,
            hook_depth,
        })
    }

    #[must_use]
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    #[must_use]
    pub fn token(&self) -> &CapabilityToken {
        &self.token
    }

    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    #[must_use]
    pub fn cost(&self) -> CostSnapshot {
        self.ledger.snapshot()
    }

    #[must_use]
    pub fn directive(&self) -> &DirectiveSpec {
        &self.directive
    }

    #[must_use]
    pub fn registry(&self) -> &ThreadRegistry {
        &self.shared.registry
    }

    /// Normalize and fold one turn's usage; `response_text` backs the
    /// estimate when the provider reported nothing.
    pub fn update_cost_after_turn(
        &mut self,
        usage: Option<TurnUsage>,
        model: &str,
        response_text: &str,
    ) -> CostSnapshot {
        let usage = usage.unwrap_or_else(|| TurnUsage::estimated_from_text(response_text));
        self.ledger.update_after_turn(usage, model);
        let snapshot = self.ledger.snapshot();
        if let Err(e) = self.shared.registry.update_usage(self.thread_id, snapshot) {
            warn!(thread = %self.thread_id, "failed to persist usage: {e}");
        }
        snapshot
    }

    /// Verify the thread's token covers `cap`. On a miss the returned event
    /// carries the `permission_denied` code for the next checkpoint.
    pub fn check_capability(&self, cap: &str) -> Result<(), Event> {
        let Ok(parsed) = Capability::parse(cap) else {
            return Err(Event::permission_denied(cap));
        };
        match self.shared.signer.verify(&self.token, AUDIENCE) {
            Ok(payload) if payload.caps.allows(&parsed) => Ok(()),
            Ok(_) => Err(Event::permission_denied(cap)),
            Err(e) => {
                warn!(thread = %self.thread_id, "token verification failed: {e}");
                Err(Event::permission_denied(cap))
            }
        }
    }

    /// Run one checkpoint: enforce limits, evaluate hooks, dispatch the
    /// first match, and interpret its action.
    pub async fn checkpoint(
        &mut self,
        name: CheckpointName,
        event: Option<Event>,
    ) -> CheckpointOutcome {
        let event = event.or_else(|| self.check_limits());
        let context = self.context(event.as_ref());
        let default = default_action(event.as_ref());

        let Some(hook) = first_match(&self.hooks, &context) else {
            return CheckpointOutcome {
                action: default,
                event,
            };
        };

        if self.hook_depth >= MAX_HOOK_DEPTH {
            warn!(
                thread = %self.thread_id,
                directive = %hook.directive,
                "hook depth limit reached; falling through to default action"
            );
            return CheckpointOutcome {
                action: default,
                event,
            };
        }
        if self.enforce_spawn_budget().is_err() {
            warn!(
                thread = %self.thread_id,
                directive = %hook.directive,
                "spawn budget exhausted; hook not launched"
            );
            return CheckpointOutcome {
                action: default,
                event,
            };
        }

        let directive = hook.directive.clone();
        let inputs = hook.resolved_inputs(&context);
        debug!(thread = %self.thread_id, checkpoint = name.as_str(), hook = %directive, "dispatching hook");

        // The hook directive runs as a child thread: spawn accounting and
        // attenuation happen before launch.
        self.ledger.note_spawn();
        let _ = self
            .shared
            .registry
            .update_usage(self.thread_id, self.ledger.snapshot());
        let child_id = ThreadId::new();
        let token = match self.shared.signer.attenuate(
            &self.token,
            &self.directive.permissions,
            self.directive.id.clone(),
            child_id,
        ) {
            Ok(token) => token,
            Err(e) => {
                warn!(thread = %self.thread_id, "hook token attenuation failed: {e}");
                return CheckpointOutcome {
                    action: HookAction::Continue,
                    event: Some(hook_failed_event(&directive, &e.to_string())),
                };
            }
        };

        let run = self
            .shared
            .hook_runner
            .run_hook(&directive, inputs, token, self.thread_id, self.hook_depth + 1)
            .await;
        match run {
            Ok(action) => {
                debug!(thread = %self.thread_id, hook = %directive, action = action.as_str(), "hook returned");
                CheckpointOutcome { action, event }
            }
            Err(e) => CheckpointOutcome {
                action: HookAction::Continue,
                event: Some(hook_failed_event(&directive, &e.message)),
            },
        }
    }

    /// Mark the thread terminal and release its registry record.
    pub fn finish(&self, status: ThreadStatus) -> Result<(), HarnessError> {
        if status == ThreadStatus::Aborted {
            self.cancel.cancel();
        }
        let _ = self
            .shared
            .registry
            .update_usage(self.thread_id, self.ledger.snapshot());
        self.shared.registry.set_status(self.thread_id, status)?;
        Ok(())
    }

    /// The thread's final structured object.
    #[must_use]
    pub fn final_report(
        &self,
        status: ThreadStatus,
        error: Option<String>,
        last_event: Option<Event>,
    ) -> FinalReport {
        FinalReport {
            status,
            error,
            cost: self.ledger.snapshot(),
            last_event,
        }
    }

    fn enforce_spawn_budget(&self) -> Result<(), HarnessError> {
        if let Some(max) = self.directive.limits.spawns {
            let current = self.ledger.spawns();
            if current >= max {
                return Err(HarnessError::SpawnBudget { current, max });
            }
        }
        Ok(())
    }

    /// First limit violation, in a fixed order.
    fn check_limits(&self) -> Option<Event> {
        let cost = self.ledger.snapshot();
        let limits = &self.directive.limits;

        if let Some(max) = limits.turns
            && cost.turns >= max
        {
            return Some(Event::limit(LimitCode::Turns.event_code(), cost.turns, max));
        }
        if let Some(max) = limits.tokens
            && cost.tokens_total >= max
        {
            return Some(Event::limit(
                LimitCode::Tokens.event_code(),
                cost.tokens_total,
                max,
            ));
        }
        if let Some(max) = limits.spawns
            && cost.spawns >= max
        {
            return Some(Event::limit(
                LimitCode::Spawns.event_code(),
                cost.spawns,
                max,
            ));
        }
        if let Some(max) = limits.duration
            && cost.duration_seconds >= max as f64
        {
            return Some(Event::limit(
                LimitCode::Duration.event_code(),
                cost.duration_seconds as u64,
                max,
            ));
        }
        if let Some(max) = limits.spend
            && cost.spend_usd >= max
        {
            return Some(Event::new(
                CheckpointName::Limit,
                LimitCode::Spend.event_code(),
                json!({ "current": cost.spend_usd, "max": max }),
            ));
        }
        None
    }

    /// The evaluator context: `{event, directive, cost, limits, permissions}`.
    fn context(&self, event: Option<&Event>) -> Value {
        json!({
            "event": event.map(Event::to_context_value).unwrap_or(Value::Null),
            "directive": self.directive.to_context_value(),
            "cost": self.ledger.snapshot().to_context_value(),
            "limits": self.directive.limits.to_context_value(),
            "permissions": self.directive.permissions,
        })
    }
}

fn hook_failed_event(directive: &str, message: &str) -> Event {
    Event::new(
        CheckpointName::Error,
        "hook_failed",
        json!({ "directive": directive, "message": message }),
    )
}

/// Default when no hook matches: limit and permission events fail the
/// thread; everything else proceeds.
fn default_action(event: Option<&Event>) -> HookAction {
    match event {
        Some(event) if event.name == CheckpointName::Limit => HookAction::Fail,
        _ => HookAction::Continue,
    }
}

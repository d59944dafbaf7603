//! Checkpoint events and hook declarations.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// The four checkpoint positions inside the safety harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointName {
    BeforeStep,
    AfterStep,
    Error,
    Limit,
}

impl CheckpointName {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BeforeStep => "before_step",
            Self::AfterStep => "after_step",
            Self::Error => "error",
            Self::Limit => "limit",
        }
    }
}

/// A checkpoint payload handed to hooks and used as the `event` branch of
/// the expression-evaluator context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: CheckpointName,
    pub code: String,
    #[serde(default)]
    pub detail: Value,
}

impl Event {
    #[must_use]
    pub fn new(name: CheckpointName, code: impl Into<String>, detail: Value) -> Self {
        Self {
            name,
            code: code.into(),
            detail,
        }
    }

    /// A limit event carrying the observed and configured values.
    #[must_use]
    pub fn limit(code: impl Into<String>, current: u64, max: u64) -> Self {
        Self::new(
            CheckpointName::Limit,
            code,
            json!({ "current": current, "max": max }),
        )
    }

    /// A permission-denied event naming the missing capability.
    #[must_use]
    pub fn permission_denied(missing: &str) -> Self {
        Self::new(
            CheckpointName::Limit,
            "permission_denied",
            json!({ "missing": missing }),
        )
    }

    /// The `event` branch of an evaluator context.
    #[must_use]
    pub fn to_context_value(&self) -> Value {
        json!({
            "name": self.name.as_str(),
            "code": self.code,
            "detail": self.detail,
        })
    }
}

/// What a hook directive tells the harness to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookAction {
    Retry,
    Continue,
    Skip,
    Fail,
    Abort,
}

impl HookAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::Continue => "continue",
            Self::Skip => "skip",
            Self::Fail => "fail",
            Self::Abort => "abort",
        }
    }
}

/// One hook declaration from directive metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookSpec {
    /// Predicate expression evaluated against the checkpoint context.
    pub when: String,
    /// Hook directive to run as a child thread when the predicate matches.
    pub directive: String,
    /// Inputs templated with `${path}` substitution before dispatch.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, Value>,
}

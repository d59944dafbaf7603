//! Resource limit declarations and limit codes.

use serde::{Deserialize, Serialize};

/// Limits declared in directive metadata. Missing values mean "unbounded".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turns: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawns: Option<u64>,
    /// Wall-clock duration in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spend: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spend_currency: Option<String>,
}

impl Limits {
    #[must_use]
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// The `limits` branch of an evaluator context.
    #[must_use]
    pub fn to_context_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Which budget axis a limit event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitCode {
    Turns,
    Tokens,
    Spawns,
    Duration,
    Spend,
}

impl LimitCode {
    /// Event code emitted when this axis is exceeded.
    #[must_use]
    pub fn event_code(self) -> &'static str {
        match self {
            Self::Turns => "turns_exceeded",
            Self::Tokens => "tokens_exceeded",
            Self::Spawns => "spawns_exceeded",
            Self::Duration => "duration_exceeded",
            Self::Spend => "spend_exceeded",
        }
    }
}

//! Token usage normalization and per-thread cost counters.

use serde::{Deserialize, Serialize};

/// Normalized usage for one LLM turn.
///
/// Providers disagree about which fields they report; this type reconciles
/// them. When usage is absent entirely (streaming teardown, error paths),
/// output tokens are estimated from the visible text and marked as such.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    /// True when output tokens were estimated rather than reported.
    #[serde(default)]
    pub estimated: bool,
}

impl TurnUsage {
    /// Normalize provider-reported usage. A missing total is reconstructed
    /// as `input + output`.
    #[must_use]
    pub fn from_provider(
        input_tokens: Option<u64>,
        output_tokens: Option<u64>,
        total_tokens: Option<u64>,
    ) -> Self {
        let input = input_tokens.unwrap_or(0);
        let output = output_tokens.unwrap_or(0);
        Self {
            input_tokens: input,
            output_tokens: output,
            total_tokens: total_tokens.unwrap_or_else(|| input.saturating_add(output)),
            estimated: false,
        }
    }

    /// Estimate usage from response text when the provider reported none.
    /// Uses the 4-chars-per-token rule.
    #[must_use]
    pub fn estimated_from_text(text: &str) -> Self {
        let output = (text.len() / 4) as u64;
        Self {
            input_tokens: 0,
            output_tokens: output,
            total_tokens: output,
            estimated: true,
        }
    }
}

/// Per-thread running counters. Monotonic over a thread's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostSnapshot {
    pub turns: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub tokens_total: u64,
    pub spawns: u64,
    pub duration_seconds: f64,
    pub spend_usd: f64,
    /// True when any contributing turn carried estimated usage.
    #[serde(default)]
    pub estimated: bool,
}

impl CostSnapshot {
    /// The `cost` branch of an evaluator context.
    #[must_use]
    pub fn to_context_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

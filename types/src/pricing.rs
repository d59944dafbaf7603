//! Data-driven model pricing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::usage::TurnUsage;

/// Per-million-token pricing for one model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

/// Pricing table keyed by model id. Unknown models fall back to `default`,
/// which is deliberately conservative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingTable {
    #[serde(default)]
    pub models: BTreeMap<String, ModelPricing>,
    pub default: ModelPricing,
}

impl PricingTable {
    /// Built-in table used when no override file is configured.
    #[must_use]
    pub fn builtin() -> Self {
        let mut models = BTreeMap::new();
        models.insert(
            "claude-sonnet-4-5".to_string(),
            ModelPricing {
                input_per_million: 3.0,
                output_per_million: 15.0,
            },
        );
        models.insert(
            "claude-haiku-4-5".to_string(),
            ModelPricing {
                input_per_million: 1.0,
                output_per_million: 5.0,
            },
        );
        models.insert(
            "claude-opus-4-1".to_string(),
            ModelPricing {
                input_per_million: 15.0,
                output_per_million: 75.0,
            },
        );
        Self {
            models,
            // Conservative: price unknown models at the top tier.
            default: ModelPricing {
                input_per_million: 15.0,
                output_per_million: 75.0,
            },
        }
    }

    #[must_use]
    pub fn pricing_for(&self, model: &str) -> ModelPricing {
        self.models.get(model).copied().unwrap_or(self.default)
    }

    /// Dollar spend for one turn's normalized usage.
    #[must_use]
    pub fn spend_for(&self, model: &str, usage: &TurnUsage) -> f64 {
        let pricing = self.pricing_for(model);
        let input = usage.input_tokens as f64 / 1_000_000.0 * pricing.input_per_million;
        let output = usage.output_tokens as f64 / 1_000_000.0 * pricing.output_per_million;
        input + output
    }
}

#[cfg(test)]
mod tests {
    use super::PricingTable;
    use crate::usage::TurnUsage;

    #[test]
    fn known_model_uses_its_rates() {
        let table = PricingTable::builtin();
        let usage = TurnUsage::from_provider(Some(1_000_000), Some(1_000_000), None);
        let spend = table.spend_for("claude-sonnet-4-5", &usage);
        assert!((spend - 18.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_falls_back_to_default() {
        let table = PricingTable::builtin();
        let usage = TurnUsage::from_provider(Some(1_000_000), None, None);
        let spend = table.spend_for("mystery-model", &usage);
        assert!((spend - 15.0).abs() < 1e-9);
    }

    #[test]
    fn table_deserializes_from_declared_shape() {
        let table: PricingTable = serde_json::from_str(
            r#"{"models": {"m1": {"input_per_million": 1.0, "output_per_million": 2.0}},
                "default": {"input_per_million": 10.0, "output_per_million": 20.0}}"#,
        )
        .unwrap();
        assert_eq!(table.pricing_for("m1").output_per_million, 2.0);
        assert_eq!(table.pricing_for("other").input_per_million, 10.0);
    }
}

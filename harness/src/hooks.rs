//! Hook compilation and first-match selection.
//!
//! Hook conditions compile at registration time, which is where malformed
//! expressions are rejected. Evaluation errors at checkpoint time are
//! downgraded to a non-match with a warning, so a bad hook can never crash
//! the harness.

use std::collections::BTreeMap;

use kiwi_expr::{Expression, substitute};
use kiwi_types::HookSpec;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum HookCompileError {
    #[error("hook {index} ('{directive}'): bad condition: {source}")]
    BadCondition {
        index: usize,
        directive: String,
        source: kiwi_expr::ExprError,
    },
}

/// A hook with its condition parsed.
#[derive(Debug, Clone)]
pub struct CompiledHook {
    pub when: Expression,
    pub when_source: String,
    pub directive: String,
    pub inputs: BTreeMap<String, Value>,
}

impl CompiledHook {
    /// Inputs with `${path}` templates substituted against the context.
    #[must_use]
    pub fn resolved_inputs(&self, context: &Value) -> Value {
        let raw = Value::Object(
            self.inputs
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        substitute(&raw, context)
    }
}

/// Compile the declared hooks, rejecting malformed conditions.
pub fn compile_hooks(specs: &[HookSpec]) -> Result<Vec<CompiledHook>, HookCompileError> {
    specs
        .iter()
        .enumerate()
        .map(|(index, spec)| {
            let when = Expression::parse(&spec.when).map_err(|source| {
                HookCompileError::BadCondition {
                    index,
                    directive: spec.directive.clone(),
                    source,
                }
            })?;
            Ok(CompiledHook {
                when,
                when_source: spec.when.clone(),
                directive: spec.directive.clone(),
                inputs: spec.inputs.clone(),
            })
        })
        .collect()
}

/// First hook whose condition is true for the context. Declared order wins.
#[must_use]
pub fn first_match<'a>(hooks: &'a [CompiledHook], context: &Value) -> Option<&'a CompiledHook> {
    for hook in hooks {
        match hook.when.matches(context) {
            Ok(true) => return Some(hook),
            Ok(false) => {}
            Err(e) => {
                warn!(
                    directive = %hook.directive,
                    condition = %hook.when_source,
                    "hook condition failed to evaluate, treating as non-match: {e}"
                );
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use kiwi_types::HookSpec;
    use serde_json::json;

    use super::{compile_hooks, first_match};

    fn spec(when: &str, directive: &str) -> HookSpec {
        HookSpec {
            when: when.to_string(),
            directive: directive.to_string(),
            inputs: BTreeMap::new(),
        }
    }

    #[test]
    fn malformed_condition_is_rejected_at_compile_time() {
        let err = compile_hooks(&[spec("event.code ==", "broken")]).unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn first_declared_match_wins() {
        let hooks = compile_hooks(&[
            spec("event.code == \"timeout\"", "first"),
            spec("event.code == \"timeout\"", "second"),
            spec("true", "catch_all"),
        ])
        .unwrap();

        let ctx = json!({"event": {"code": "timeout"}});
        assert_eq!(first_match(&hooks, &ctx).unwrap().directive, "first");

        let ctx = json!({"event": {"code": "other"}});
        assert_eq!(first_match(&hooks, &ctx).unwrap().directive, "catch_all");
    }

    #[test]
    fn no_match_yields_none() {
        let hooks = compile_hooks(&[spec("event.code == \"x\"", "only")]).unwrap();
        assert!(first_match(&hooks, &json!({"event": {"code": "y"}})).is_none());
    }

    #[test]
    fn eval_error_falls_through_to_later_hooks() {
        // "a" < 1 is a type error at evaluation time
        let hooks = compile_hooks(&[
            spec("\"a\" < 1", "broken_at_eval"),
            spec("true", "fallback"),
        ])
        .unwrap();
        assert_eq!(
            first_match(&hooks, &json!({})).unwrap().directive,
            "fallback"
        );
    }

    #[test]
    fn inputs_template_against_the_context() {
        let mut inputs = BTreeMap::new();
        inputs.insert("cap".to_string(), json!("${event.detail.missing}"));
        let hooks = compile_hooks(&[HookSpec {
            when: "event.code == \"permission_denied\"".to_string(),
            directive: "request_elevated_permissions".to_string(),
            inputs,
        }])
        .unwrap();

        let ctx = json!({"event": {"code": "permission_denied", "detail": {"missing": "fs.write"}}});
        let hook = first_match(&hooks, &ctx).unwrap();
        assert_eq!(hook.resolved_inputs(&ctx)["cap"], "fs.write");
    }
}

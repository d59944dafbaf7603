//! The slice of directive metadata the kernel consumes.
//!
//! Directives themselves (markdown/XML instruction files) are an external
//! collaborator; the harness only needs their declared permissions, limits,
//! hooks, and model.

use serde::{Deserialize, Serialize};

use crate::capability::PermissionSpec;
use crate::event::HookSpec;
use crate::ids::DirectiveId;
use crate::limits::Limits;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectiveSpec {
    pub id: DirectiveId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub permissions: Vec<PermissionSpec>,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub hooks: Vec<HookSpec>,
}

impl DirectiveSpec {
    /// A directive with no grants, no hooks, and unbounded limits.
    #[must_use]
    pub fn bare(id: impl Into<String>) -> Self {
        Self {
            id: DirectiveId::new(id),
            model: None,
            permissions: Vec::new(),
            limits: Limits::unbounded(),
            hooks: Vec::new(),
        }
    }

    /// The `directive` branch of an evaluator context.
    #[must_use]
    pub fn to_context_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

//! Tool manifests: the metadata record extracted from on-disk tool content.
//!
//! The kernel never hardcodes a list of executors. A tool declares how it is
//! executed via `executor_id`; the only compiled-in implementations are the
//! two terminal primitives. [`ExecutorBinding`] is the sum type the chain
//! walker pattern-matches on.

use std::collections::BTreeMap;

use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Classification of a tool file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolType {
    Primitive,
    Runtime,
    Python,
    Api,
    McpServer,
    McpTool,
    Library,
}

impl ToolType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primitive => "primitive",
            Self::Runtime => "runtime",
            Self::Python => "python",
            Self::Api => "api",
            Self::McpServer => "mcp_server",
            Self::McpTool => "mcp_tool",
            Self::Library => "library",
        }
    }
}

/// Terminal primitive implementations compiled into the kernel.
///
/// New primitives are added by extending this enum, not by dropping a file
/// on disk. The filesystem still carries the primitive's manifest so chains
/// can resolve to it and lockfiles can pin it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimitiveKind {
    Subprocess,
    HttpClient,
}

impl PrimitiveKind {
    /// Map a primitive tool's id to its compiled-in implementation.
    #[must_use]
    pub fn from_tool_id(tool_id: &str) -> Option<Self> {
        match tool_id {
            "subprocess" => Some(Self::Subprocess),
            "http_client" => Some(Self::HttpClient),
            _ => None,
        }
    }

    /// Infer the implementation for a primitive tool: the canonical ids
    /// first, then the shape of its config (`command` → subprocess,
    /// `url` → HTTP).
    #[must_use]
    pub fn infer(tool_id: &str, config: Option<&Value>) -> Option<Self> {
        if let Some(kind) = Self::from_tool_id(tool_id) {
            return Some(kind);
        }
        let config = config?.as_object()?;
        if config.contains_key("command") {
            return Some(Self::Subprocess);
        }
        if config.contains_key("url") {
            return Some(Self::HttpClient);
        }
        None
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Subprocess => "subprocess",
            Self::HttpClient => "http_client",
        }
    }
}

/// Where to look for a virtualenv interpreter, in declared order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchRoot {
    Project,
    User,
    Kiwi,
    System,
}

/// Interpreter resolution strategies recognized by the env resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterpreterKind {
    VenvPython,
    PathBinary,
}

/// Declares how a runtime's interpreter is located and bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterpreterSpec {
    #[serde(rename = "type")]
    pub kind: InterpreterKind,
    /// Variable the resolved interpreter path is bound to (e.g. `RYE_PYTHON`).
    pub var: String,
    /// Search order for `venv_python`; ignored for `path_binary`.
    #[serde(default)]
    pub search: Vec<SearchRoot>,
    /// Binary name for `path_binary` lookup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,
    /// Used when no interpreter is found (e.g. `python3`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
}

/// A runtime tool's `ENV_CONFIG`: interpreter resolution plus exported vars.
///
/// Resolved at each runtime hop during execution, never at init time, so
/// environment changes between executions are observed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<InterpreterSpec>,
    /// Variables to export; values may contain `${VAR}` templates.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// How a tool delegates execution — the chain walker's dispatch type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorBinding {
    /// Terminal hop; runs a compiled-in primitive.
    Primitive(PrimitiveKind),
    /// Resolves an environment, then delegates to `executor_id`.
    Runtime {
        executor_id: String,
        env_config: EnvConfig,
    },
    /// Plain delegation to another tool by id.
    Delegated { executor_id: String },
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("tool '{tool_id}' has no executor_id but is not a primitive (type {tool_type})")]
    MissingExecutor { tool_id: String, tool_type: String },
    #[error("primitive tool '{tool_id}' must not declare executor_id '{executor_id}'")]
    PrimitiveWithExecutor { tool_id: String, executor_id: String },
    #[error("no compiled-in primitive named '{tool_id}'")]
    UnknownPrimitive { tool_id: String },
    #[error("tool '{tool_id}': {message}")]
    Malformed { tool_id: String, message: String },
}

/// The metadata record for one addressable tool on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolManifest {
    pub tool_id: String,
    pub tool_type: ToolType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_id: Option<String>,
    pub category: String,
    pub version: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_config: Option<EnvConfig>,
    /// Capability names this tool requires of its caller.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
    /// Semver requirement this executor imposes on tools delegating to it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_version_req: Option<String>,
    /// Canonical SHA-256 over manifest + file table. Empty until hashed.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content_hash: String,
}

impl ToolManifest {
    /// Derive the execution binding, enforcing the null-iff-primitive invariant.
    pub fn binding(&self) -> Result<ExecutorBinding, ManifestError> {
        match (&self.executor_id, self.tool_type) {
            (None, ToolType::Primitive) => {
                PrimitiveKind::infer(&self.tool_id, self.config.as_ref())
                    .map(ExecutorBinding::Primitive)
                    .ok_or_else(|| ManifestError::UnknownPrimitive {
                        tool_id: self.tool_id.clone(),
                    })
            }
            (None, other) => Err(ManifestError::MissingExecutor {
                tool_id: self.tool_id.clone(),
                tool_type: other.as_str().to_string(),
            }),
            (Some(executor_id), ToolType::Primitive) => Err(ManifestError::PrimitiveWithExecutor {
                tool_id: self.tool_id.clone(),
                executor_id: executor_id.clone(),
            }),
            (Some(executor_id), ToolType::Runtime) => Ok(ExecutorBinding::Runtime {
                executor_id: executor_id.clone(),
                env_config: self.env_config.clone().unwrap_or_default(),
            }),
            (Some(executor_id), _) => Ok(ExecutorBinding::Delegated {
                executor_id: executor_id.clone(),
            }),
        }
    }

    #[must_use]
    pub fn is_primitive(&self) -> bool {
        self.tool_type == ToolType::Primitive
    }
}

#[cfg(test)]
mod tests {
    use super::{ExecutorBinding, ManifestError, PrimitiveKind, ToolManifest, ToolType};

    fn manifest(tool_id: &str, tool_type: ToolType, executor_id: Option<&str>) -> ToolManifest {
        ToolManifest {
            tool_id: tool_id.to_string(),
            tool_type,
            executor_id: executor_id.map(ToString::to_string),
            category: "test".to_string(),
            version: semver::Version::new(1, 0, 0),
            config_schema: None,
            config: None,
            env_config: None,
            requires: Vec::new(),
            child_version_req: None,
            content_hash: String::new(),
        }
    }

    #[test]
    fn primitive_binding_resolves_compiled_in_kind() {
        let m = manifest("subprocess", ToolType::Primitive, None);
        assert_eq!(
            m.binding().unwrap(),
            ExecutorBinding::Primitive(PrimitiveKind::Subprocess)
        );
        let m = manifest("http_client", ToolType::Primitive, None);
        assert_eq!(
            m.binding().unwrap(),
            ExecutorBinding::Primitive(PrimitiveKind::HttpClient)
        );
    }

    #[test]
    fn unknown_primitive_is_rejected() {
        let m = manifest("mystery", ToolType::Primitive, None);
        assert!(matches!(
            m.binding(),
            Err(ManifestError::UnknownPrimitive { .. })
        ));
    }

    #[test]
    fn primitive_kind_inferred_from_config_shape() {
        let mut m = manifest("echo", ToolType::Primitive, None);
        m.config = Some(serde_json::json!({ "command": "echo", "args": ["hello"] }));
        assert_eq!(
            m.binding().unwrap(),
            ExecutorBinding::Primitive(PrimitiveKind::Subprocess)
        );

        let mut m = manifest("fetch", ToolType::Primitive, None);
        m.config = Some(serde_json::json!({ "url": "https://example.com" }));
        assert_eq!(
            m.binding().unwrap(),
            ExecutorBinding::Primitive(PrimitiveKind::HttpClient)
        );
    }

    #[test]
    fn non_primitive_without_executor_is_rejected() {
        let m = manifest("my_tool", ToolType::Python, None);
        assert!(matches!(
            m.binding(),
            Err(ManifestError::MissingExecutor { .. })
        ));
    }

    #[test]
    fn primitive_with_executor_is_rejected() {
        let m = manifest("subprocess", ToolType::Primitive, Some("python_runtime"));
        assert!(matches!(
            m.binding(),
            Err(ManifestError::PrimitiveWithExecutor { .. })
        ));
    }

    #[test]
    fn runtime_binding_carries_env_config() {
        let mut m = manifest("python_runtime", ToolType::Runtime, Some("subprocess"));
        m.env_config = Some(super::EnvConfig::default());
        match m.binding().unwrap() {
            ExecutorBinding::Runtime { executor_id, .. } => assert_eq!(executor_id, "subprocess"),
            other => panic!("expected runtime binding, got {other:?}"),
        }
    }

    #[test]
    fn delegated_binding_for_leaf_tools() {
        let m = manifest("my_tool", ToolType::Python, Some("python_runtime"));
        match m.binding().unwrap() {
            ExecutorBinding::Delegated { executor_id } => {
                assert_eq!(executor_id, "python_runtime");
            }
            other => panic!("expected delegated binding, got {other:?}"),
        }
    }
}

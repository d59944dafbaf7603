//! Metadata extraction from tool files.
//!
//! A tool's metadata lives in its leading comment block: `# key: value`
//! lines before the first non-comment line. A shebang and the optional
//! signature line are skipped. Values that look like JSON parse as JSON;
//! anything else is taken as a raw string. A `<stem>.meta.json` sidecar
//! overrides header keys field-by-field.

use std::fs;
use std::path::Path;

use kiwi_types::{EnvConfig, ToolManifest, ToolType};
use semver::Version;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::integrity;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("failed to read '{path}': {reason}")]
    Io { path: String, reason: String },
    #[error("tool '{tool_id}' declares no tool_type")]
    MissingToolType { tool_id: String },
    #[error("tool '{tool_id}': bad value for '{key}': {reason}")]
    BadValue {
        tool_id: String,
        key: String,
        reason: String,
    },
    #[error(transparent)]
    Invariant(#[from] kiwi_types::ManifestError),
    #[error(transparent)]
    Integrity(#[from] integrity::IntegrityError),
}

/// Extract and hash the manifest for a tool path.
///
/// The returned record carries a populated `content_hash`.
pub fn extract_manifest(path: &Path) -> Result<ToolManifest, MetadataError> {
    let tool_id = path
        .file_stem()
        .map_or_else(String::new, |s| s.to_string_lossy().into_owned());

    let content = fs::read_to_string(path).map_err(|e| MetadataError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let mut fields = parse_header(&content);
    apply_sidecar(path, &mut fields)?;

    let mut manifest = build_manifest(&tool_id, &fields)?;
    // Enforce the null-iff-primitive invariant at extraction time.
    manifest.binding()?;
    manifest.content_hash = integrity::content_hash(path, &manifest)?;
    Ok(manifest)
}

/// Parse the leading comment block into a key → JSON value map.
fn parse_header(content: &str) -> Map<String, Value> {
    let mut fields = Map::new();
    for (index, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if index == 0 && trimmed.starts_with("#!") {
            continue;
        }
        let Some(comment) = trimmed.strip_prefix('#') else {
            break;
        };
        let comment = comment.trim_start();
        if integrity::parse_signature(trimmed).is_some() {
            continue;
        }
        let Some((key, value)) = comment.split_once(':') else {
            continue;
        };
        let key = key.trim();
        if !is_metadata_key(key) {
            continue;
        }
        fields.insert(key.to_string(), parse_value(value.trim()));
    }
    fields
}

fn is_metadata_key(key: &str) -> bool {
    matches!(
        key,
        "tool_type"
            | "executor_id"
            | "category"
            | "version"
            | "config_schema"
            | "config"
            | "env_config"
            | "requires"
            | "child_version_req"
    )
}

/// JSON where it looks like JSON, raw string otherwise.
fn parse_value(raw: &str) -> Value {
    let looks_structured = raw.starts_with('{')
        || raw.starts_with('[')
        || raw.starts_with('"')
        || raw == "null"
        || raw == "true"
        || raw == "false"
        || raw.parse::<f64>().is_ok();
    if looks_structured {
        if let Ok(value) = serde_json::from_str(raw) {
            return value;
        }
    }
    Value::String(raw.to_string())
}

fn apply_sidecar(path: &Path, fields: &mut Map<String, Value>) -> Result<(), MetadataError> {
    let sidecar = path.with_extension("meta.json");
    if !sidecar.is_file() {
        return Ok(());
    }
    let content = fs::read_to_string(&sidecar).map_err(|e| MetadataError::Io {
        path: sidecar.display().to_string(),
        reason: e.to_string(),
    })?;
    let overrides: Map<String, Value> =
        serde_json::from_str(&content).map_err(|e| MetadataError::Io {
            path: sidecar.display().to_string(),
            reason: format!("invalid sidecar JSON: {e}"),
        })?;
    for (key, value) in overrides {
        if is_metadata_key(&key) {
            fields.insert(key, value);
        }
    }
    Ok(())
}

fn build_manifest(tool_id: &str, fields: &Map<String, Value>) -> Result<ToolManifest, MetadataError> {
    let bad = |key: &str, reason: String| MetadataError::BadValue {
        tool_id: tool_id.to_string(),
        key: key.to_string(),
        reason,
    };

    let tool_type: ToolType = match fields.get("tool_type") {
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| bad("tool_type", e.to_string()))?,
        None => {
            return Err(MetadataError::MissingToolType {
                tool_id: tool_id.to_string(),
            });
        }
    };

    let executor_id = match fields.get("executor_id") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s == "null" => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => return Err(bad("executor_id", format!("expected string, got {other}"))),
    };

    let version = match fields.get("version") {
        Some(Value::String(s)) => {
            Version::parse(s).map_err(|e| bad("version", e.to_string()))?
        }
        Some(other) => return Err(bad("version", format!("expected string, got {other}"))),
        None => Version::new(0, 0, 0),
    };

    let category = match fields.get("category") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => return Err(bad("category", format!("expected string, got {other}"))),
        None => "uncategorized".to_string(),
    };

    let env_config: Option<EnvConfig> = match fields.get("env_config") {
        Some(value) => Some(
            serde_json::from_value(value.clone()).map_err(|e| bad("env_config", e.to_string()))?,
        ),
        None => None,
    };

    let requires = match fields.get("requires") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| match v {
                Value::String(s) => Ok(s.clone()),
                other => Err(bad("requires", format!("expected string, got {other}"))),
            })
            .collect::<Result<Vec<String>, MetadataError>>()?,
        Some(other) => return Err(bad("requires", format!("expected array, got {other}"))),
        None => Vec::new(),
    };

    Ok(ToolManifest {
        tool_id: tool_id.to_string(),
        tool_type,
        executor_id,
        category,
        version,
        config_schema: fields.get("config_schema").cloned(),
        config: fields.get("config").cloned(),
        env_config,
        requires,
        child_version_req: match fields.get("child_version_req") {
            Some(Value::String(s)) => Some(s.clone()),
            _ => None,
        },
        content_hash: String::new(),
    })
}

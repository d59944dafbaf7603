//! Chain validation: adjacent parent/child compatibility for a resolved
//! chain.
//!
//! Warnings never invalidate a chain; issues do.

use kiwi_types::{ChainEntry, ChainValidation, MAX_CHAIN_DEPTH, ResolvedChain, ToolManifest};
use semver::VersionReq;
use tracing::debug;

fn manifest_of(entry: &ChainEntry) -> Option<ToolManifest> {
    entry
        .manifest
        .as_ref()
        .and_then(|value| serde_json::from_value(value.clone()).ok())
}

/// Validate a resolved chain structurally.
///
/// For each adjacent `(child, parent)` pair: the child must delegate to the
/// parent, the parent's declared version requirement (if any) must hold for
/// the child, and the child's concrete config must satisfy the parent's
/// config schema when both are present.
#[must_use]
pub fn validate_chain(chain: &ResolvedChain) -> ChainValidation {
    let entries = chain.entries();
    let mut result = ChainValidation::valid(entries.len().saturating_sub(1));

    if entries.is_empty() {
        result.push_issue("chain is empty");
        return result;
    }
    if entries.len() > MAX_CHAIN_DEPTH {
        result.push_issue(format!(
            "chain depth {} exceeds the maximum of {MAX_CHAIN_DEPTH}",
            entries.len()
        ));
    }

    let terminal = &entries[entries.len() - 1];
    if !terminal.is_terminal() {
        result.push_issue(format!(
            "chain does not terminate at a primitive: '{}' still delegates to '{}'",
            terminal.tool_id,
            terminal.executor_id.as_deref().unwrap_or("?")
        ));
    }

    for pair in entries.windows(2) {
        let (child, parent) = (&pair[0], &pair[1]);
        validate_pair(child, parent, &mut result);
    }

    debug!(
        pairs = result.validated_pairs,
        issues = result.issues.len(),
        warnings = result.warnings.len(),
        "validated chain"
    );
    result
}

fn validate_pair(child: &ChainEntry, parent: &ChainEntry, result: &mut ChainValidation) {
    match child.executor_id.as_deref() {
        Some(executor_id) if executor_id == parent.tool_id => {}
        Some(executor_id) => result.push_issue(format!(
            "'{}' delegates to '{executor_id}' but the chain continues with '{}'",
            child.tool_id, parent.tool_id
        )),
        None => result.push_issue(format!(
            "'{}' is terminal but is followed by '{}'",
            child.tool_id, parent.tool_id
        )),
    }

    let parent_manifest = manifest_of(parent);
    let child_manifest = manifest_of(child);

    if let Some(req) = parent_manifest.as_ref().and_then(|m| m.child_version_req.clone()) {
        match VersionReq::parse(&req) {
            Ok(req) => {
                if !req.matches(&child.version) {
                    result.push_issue(format!(
                        "'{}' version {} does not satisfy '{}' requirement '{req}'",
                        child.tool_id, child.version, parent.tool_id
                    ));
                }
            }
            Err(e) => result.push_warning(format!(
                "'{}' declares an unparseable child_version_req '{req}': {e}",
                parent.tool_id
            )),
        }
    }

    if let Some(schema) = parent_manifest.as_ref().and_then(|m| m.config_schema.clone()) {
        let validator = match jsonschema::validator_for(&schema) {
            Ok(v) => v,
            Err(e) => {
                result.push_issue(format!(
                    "'{}' declares an invalid config_schema: {e}",
                    parent.tool_id
                ));
                return;
            }
        };
        match child_manifest.as_ref().and_then(|m| m.config.clone()) {
            Some(config) => {
                if let Err(error) = validator.validate(&config) {
                    result.push_issue(format!(
                        "'{}' config does not satisfy '{}' schema: {error}",
                        child.tool_id, parent.tool_id
                    ));
                }
            }
            None => result.push_warning(format!(
                "'{}' declares a config_schema but '{}' carries no config",
                parent.tool_id, child.tool_id
            )),
        }
    }
}

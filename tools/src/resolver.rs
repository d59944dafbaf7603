//! Executor resolution: filesystem search for a named executor across
//! scoped tool roots.
//!
//! There is no hardcoded list of executor names. Roots are searched in
//! order (project, then user), recursively, and the first file whose stem
//! matches wins.

use std::path::PathBuf;

use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

use crate::roots::{Scope, ToolRoots};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no executor named '{executor_id}' under any tool root")]
    ExecutorNotFound { executor_id: String },
}

/// Sidecar and state files that never resolve as tools.
fn is_tool_candidate(path: &std::path::Path) -> bool {
    let name = path.file_name().map(|n| n.to_string_lossy());
    let Some(name) = name else { return false };
    !name.ends_with(".meta.json") && !name.ends_with(".lock.json")
}

/// Resolve `executor_id` to the path of the matching tool file.
pub fn resolve_executor(
    executor_id: &str,
    roots: &ToolRoots,
) -> Result<(Scope, PathBuf), ResolveError> {
    for (scope, dir) in roots.tool_dirs() {
        if !dir.is_dir() {
            continue;
        }
        for entry in WalkDir::new(&dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
        {
            if !entry.file_type().is_file() || !is_tool_candidate(entry.path()) {
                continue;
            }
            let stem = entry.path().file_stem().map(|s| s.to_string_lossy());
            if stem.as_deref() == Some(executor_id) {
                debug!(
                    executor_id,
                    scope = scope.as_str(),
                    path = %entry.path().display(),
                    "resolved executor"
                );
                return Ok((scope, entry.path().to_path_buf()));
            }
        }
    }
    Err(ResolveError::ExecutorNotFound {
        executor_id: executor_id.to_string(),
    })
}

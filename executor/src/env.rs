//! Env resolution for runtime hops.
//!
//! Invoked at each runtime hop during execution, never at executor init
//! time, so an activated venv or a PATH change between executions is
//! observed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use kiwi_tools::ToolRoots;
use kiwi_types::{EnvConfig, InterpreterKind, InterpreterSpec, SearchRoot};
use kiwi_utils::template::expand_map;
use tracing::debug;

#[cfg(not(windows))]
const VENV_PYTHON: &[&str] = &[".venv/bin/python", "venv/bin/python"];
#[cfg(windows)]
const VENV_PYTHON: &[&str] = &[".venv/Scripts/python.exe", "venv/Scripts/python.exe"];

fn venv_python_under(dir: &Path) -> Option<PathBuf> {
    VENV_PYTHON
        .iter()
        .map(|rel| dir.join(rel))
        .find(|candidate| candidate.is_file())
}

fn search_venv(roots: &ToolRoots, order: &[SearchRoot]) -> Option<PathBuf> {
    for root in order {
        let found = match root {
            SearchRoot::Project => roots.project_dir().and_then(|dir| {
                // The project scope dir is `<project>/.kiwi`; venvs live
                // beside it.
                dir.parent().and_then(venv_python_under)
            }),
            SearchRoot::User => dirs::home_dir().as_deref().and_then(venv_python_under),
            SearchRoot::Kiwi => venv_python_under(roots.user_dir()),
            SearchRoot::System => which::which("python3").ok(),
        };
        if let Some(found) = found {
            return Some(found);
        }
    }
    None
}

fn resolve_interpreter(spec: &InterpreterSpec, roots: &ToolRoots) -> String {
    let found = match spec.kind {
        InterpreterKind::VenvPython => search_venv(roots, &spec.search),
        InterpreterKind::PathBinary => spec
            .binary
            .as_deref()
            .and_then(|binary| which::which(binary).ok()),
    };
    match found {
        Some(path) => path.display().to_string(),
        None => {
            let fallback = spec.fallback.clone().unwrap_or_default();
            debug!(var = %spec.var, %fallback, "no interpreter found; using fallback");
            fallback
        }
    }
}

/// Produce the resolved environment a runtime hop exports downstream.
///
/// The process environment is read at call time; declared entries expand
/// `${VAR}` and `${VAR:-default}` against each other and the process env.
#[must_use]
pub fn resolve_env(config: &EnvConfig, roots: &ToolRoots) -> BTreeMap<String, String> {
    let mut declared = config.env.clone();
    if let Some(spec) = &config.interpreter {
        declared.insert(spec.var.clone(), resolve_interpreter(spec, roots));
    }
    let base: BTreeMap<String, String> = std::env::vars().collect();
    expand_map(&declared, &base)
}

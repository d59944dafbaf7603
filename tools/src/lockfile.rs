//! Lockfile store: freeze, load, validate, and prune resolved chains.
//!
//! Lockfiles live under `{scope}/lockfiles/{category}/` with the project
//! scope taking precedence over the user scope. Writes go through an
//! advisory lock plus atomic rename; readers are lock-free.

use std::fs;
use std::path::PathBuf;

use chrono::Utc;
use kiwi_types::{ChainValidation, Lockfile, ResolvedChain};
use kiwi_utils::{FileLock, atomic_write};
use semver::Version;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::roots::{Scope, ToolRoots};

#[derive(Debug, Error)]
pub enum LockfileError {
    #[error("cannot freeze an empty chain")]
    EmptyChain,
    #[error("no writable lockfile scope is configured")]
    NoScope,
    #[error("lockfile io at '{path}': {reason}")]
    Io { path: String, reason: String },
    #[error("lockfile at '{path}' is malformed: {reason}")]
    Malformed { path: String, reason: String },
}

/// Store rooted at the active scopes.
#[derive(Debug, Clone)]
pub struct LockfileStore {
    roots: ToolRoots,
}

/// Short stable hash over the ordered chain, used to disambiguate
/// lockfiles of the same root tool resolved through different chains.
#[must_use]
pub fn chain_hash(chain: &ResolvedChain) -> String {
    let joined: Vec<String> = chain
        .iter()
        .map(|e| format!("{}@{}#{}", e.tool_id, e.version, e.content_hash))
        .collect();
    let digest = Sha256::digest(joined.join("\n").as_bytes());
    hex::encode(digest)[..12].to_string()
}

fn lockfile_name(tool_id: &str, version: &Version, chain: &ResolvedChain) -> String {
    if chain.len() <= 1 {
        format!("{tool_id}@{version}.lock.json")
    } else {
        format!("{tool_id}@{version}.{}.lock.json", chain_hash(chain))
    }
}

impl LockfileStore {
    #[must_use]
    pub fn new(roots: ToolRoots) -> Self {
        Self { roots }
    }

    /// The directory new lockfiles are written to: project scope first,
    /// user scope otherwise.
    fn write_dir(&self, category: &str) -> Result<PathBuf, LockfileError> {
        let dir = self
            .roots
            .lockfile_dir(Scope::Project)
            .or_else(|| self.roots.lockfile_dir(Scope::User))
            .ok_or(LockfileError::NoScope)?;
        Ok(dir.join(category))
    }

    /// Freeze a resolved chain into a lockfile on disk.
    pub fn freeze_chain(
        &self,
        chain: &ResolvedChain,
        category: &str,
    ) -> Result<Lockfile, LockfileError> {
        let lockfile = Lockfile::freeze(chain, Utc::now()).ok_or(LockfileError::EmptyChain)?;
        let dir = self.write_dir(category)?;
        let path = dir.join(lockfile_name(
            &lockfile.root.tool_id,
            &lockfile.root.version,
            chain,
        ));

        let io = |e: std::io::Error| LockfileError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        };
        fs::create_dir_all(&dir).map_err(io)?;
        let _lock = FileLock::acquire(&path).map_err(io)?;
        let json = serde_json::to_vec_pretty(&lockfile).map_err(|e| LockfileError::Malformed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        atomic_write(&path, &json).map_err(io)?;
        debug!(path = %path.display(), "froze chain");
        Ok(lockfile)
    }

    /// Load the lockfile for `tool_id@version`, project scope first.
    pub fn get_lockfile(
        &self,
        tool_id: &str,
        version: &Version,
        category: &str,
    ) -> Result<Option<Lockfile>, LockfileError> {
        let prefix = format!("{tool_id}@{version}");
        for scope in [Scope::Project, Scope::User] {
            let Some(dir) = self.roots.lockfile_dir(scope) else {
                continue;
            };
            let dir = dir.join(category);
            if !dir.is_dir() {
                continue;
            }
            let mut candidates: Vec<PathBuf> = read_dir_paths(&dir)?
                .into_iter()
                .filter(|p| {
                    p.file_name()
                        .map(|n| n.to_string_lossy())
                        .is_some_and(|name| {
                            name.ends_with(".lock.json")
                                && (name.as_ref() == format!("{prefix}.lock.json")
                                    || name.starts_with(&format!("{prefix}.")))
                        })
                })
                .collect();
            candidates.sort();
            if let Some(path) = candidates.first() {
                return self.read_lockfile(path).map(Some);
            }
        }
        Ok(None)
    }

    fn read_lockfile(&self, path: &PathBuf) -> Result<Lockfile, LockfileError> {
        let content = fs::read_to_string(path).map_err(|e| LockfileError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&content).map_err(|e| LockfileError::Malformed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Every lockfile on disk, optionally restricted to one category.
    pub fn list_lockfiles(
        &self,
        category: Option<&str>,
    ) -> Result<Vec<PathBuf>, LockfileError> {
        let mut found = Vec::new();
        for scope in [Scope::Project, Scope::User] {
            let Some(dir) = self.roots.lockfile_dir(scope) else {
                continue;
            };
            if !dir.is_dir() {
                continue;
            }
            for category_dir in read_dir_paths(&dir)? {
                if !category_dir.is_dir() {
                    continue;
                }
                if let Some(wanted) = category {
                    if category_dir.file_name().map(|n| n.to_string_lossy())
                        != Some(wanted.into())
                    {
                        continue;
                    }
                }
                found.extend(read_dir_paths(&category_dir)?.into_iter().filter(|p| {
                    p.file_name()
                        .map(|n| n.to_string_lossy())
                        .is_some_and(|n| n.ends_with(".lock.json"))
                }));
            }
        }
        found.sort();
        Ok(found)
    }

    /// Delete lockfiles older than `max_age_days`. Returns the count removed.
    pub fn prune_stale(&self, max_age_days: u32) -> Result<usize, LockfileError> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(max_age_days));
        let mut removed = 0;
        for path in self.list_lockfiles(None)? {
            let lockfile = match self.read_lockfile(&path) {
                Ok(l) => l,
                Err(e) => {
                    warn!(path = %path.display(), "skipping unreadable lockfile during prune: {e}");
                    continue;
                }
            };
            if lockfile.generated_at < cutoff {
                fs::remove_file(&path).map_err(|e| LockfileError::Io {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Validate a lockfile against a freshly resolved chain.
    ///
    /// Every recorded entry must still resolve at the same version with the
    /// same content hash.
    #[must_use]
    pub fn validate_lockfile(
        &self,
        lockfile: &Lockfile,
        current_chain: &ResolvedChain,
    ) -> ChainValidation {
        let mut result = ChainValidation::valid(lockfile.resolved_chain.len());

        for recorded in &lockfile.resolved_chain {
            let Some(current) = current_chain
                .iter()
                .find(|e| e.tool_id == recorded.tool_id)
            else {
                result.push_issue(format!(
                    "Tool '{}' missing from resolved chain",
                    recorded.tool_id
                ));
                continue;
            };
            if current.version != recorded.version {
                result.push_issue(format!(
                    "Tool '{}' version changed from {} to {}",
                    recorded.tool_id, recorded.version, current.version
                ));
            }
            if current.content_hash != recorded.content_hash {
                result.push_issue(format!(
                    "Tool '{}' integrity hash mismatch",
                    recorded.tool_id
                ));
            }
        }

        if current_chain.len() != lockfile.resolved_chain.len() {
            result.push_warning(format!(
                "chain length changed from {} to {}",
                lockfile.resolved_chain.len(),
                current_chain.len()
            ));
        }
        result
    }
}

fn read_dir_paths(dir: &std::path::Path) -> Result<Vec<PathBuf>, LockfileError> {
    let entries = fs::read_dir(dir).map_err(|e| LockfileError::Io {
        path: dir.display().to_string(),
        reason: e.to_string(),
    })?;
    Ok(entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .collect())
}

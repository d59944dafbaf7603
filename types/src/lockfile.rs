//! Lockfile wire format: a frozen record of a resolved chain.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chain::{ChainEntry, ResolvedChain};

/// Current lockfile schema version.
pub const LOCKFILE_VERSION: u32 = 1;

/// Where a tool registry snapshot came from, when one was consulted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryInfo {
    pub url: String,
    pub fetched_at: DateTime<Utc>,
}

/// JSON lockfile, keys in declared order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lockfile {
    pub lockfile_version: u32,
    pub generated_at: DateTime<Utc>,
    pub root: ChainEntry,
    pub resolved_chain: Vec<ChainEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<RegistryInfo>,
}

impl Lockfile {
    /// Freeze a resolved chain. The chain's leaf becomes the root entry.
    #[must_use]
    pub fn freeze(chain: &ResolvedChain, generated_at: DateTime<Utc>) -> Option<Self> {
        let root = chain.leaf()?.clone();
        Some(Self {
            lockfile_version: LOCKFILE_VERSION,
            generated_at,
            root,
            resolved_chain: chain.entries().to_vec(),
            registry: None,
        })
    }
}

/// Outcome of validating a chain or a lockfile against fresh state.
///
/// Warnings never invalidate; issues do.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainValidation {
    pub is_valid: bool,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
    pub validated_pairs: usize,
}

impl ChainValidation {
    #[must_use]
    pub fn valid(validated_pairs: usize) -> Self {
        Self {
            is_valid: true,
            issues: Vec::new(),
            warnings: Vec::new(),
            validated_pairs,
        }
    }

    pub fn push_issue(&mut self, issue: impl Into<String>) {
        self.issues.push(issue.into());
        self.is_valid = false;
    }

    pub fn push_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }
}

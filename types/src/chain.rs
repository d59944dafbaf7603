//! Resolved executor chains.

use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::manifest::ToolManifest;

/// Maximum number of hops an executor chain may take before it is rejected.
pub const MAX_CHAIN_DEPTH: usize = 10;

/// One hop of a resolved chain, as persisted in lockfiles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainEntry {
    pub tool_id: String,
    pub version: Version,
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<Value>,
}

impl ChainEntry {
    /// Build an entry from a hashed manifest, embedding the manifest record.
    #[must_use]
    pub fn from_manifest(manifest: &ToolManifest) -> Self {
        Self {
            tool_id: manifest.tool_id.clone(),
            version: manifest.version.clone(),
            content_hash: manifest.content_hash.clone(),
            executor_id: manifest.executor_id.clone(),
            manifest: serde_json::to_value(manifest).ok(),
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.executor_id.is_none()
    }
}

/// Ordered list `[leaf, …, primitive]` discovered by the chain walk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResolvedChain {
    entries: Vec<ChainEntry>,
}

impl ResolvedChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: ChainEntry) {
        self.entries.push(entry);
    }

    #[must_use]
    pub fn entries(&self) -> &[ChainEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn leaf(&self) -> Option<&ChainEntry> {
        self.entries.first()
    }

    #[must_use]
    pub fn terminal(&self) -> Option<&ChainEntry> {
        self.entries.last()
    }

    /// Whether the chain ends at a primitive within the depth bound.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.len() <= MAX_CHAIN_DEPTH && self.terminal().is_some_and(ChainEntry::is_terminal)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChainEntry> {
        self.entries.iter()
    }
}

impl IntoIterator for ResolvedChain {
    type Item = ChainEntry;
    type IntoIter = std::vec::IntoIter<ChainEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl FromIterator<ChainEntry> for ResolvedChain {
    fn from_iter<I: IntoIterator<Item = ChainEntry>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

//! Capability names and sets.
//!
//! Capability names take the form `<resource>.<action>` (`fs.read`,
//! `tool.bash`, `spawn.thread`). A `*` wildcard is permitted only in the
//! action slot of a declared permission tag; it never appears inside a
//! capability string, so wildcard grants are tracked as whole-resource
//! grants alongside the exact set.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CapabilityParseError {
    #[error("capability '{0}' must be of the form <resource>.<action>")]
    BadShape(String),
    #[error("capability '{0}' must not contain a wildcard")]
    Wildcard(String),
}

/// A single validated capability name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Capability {
    resource: String,
    action: String,
}

impl Capability {
    pub fn parse(s: &str) -> Result<Self, CapabilityParseError> {
        if s.contains('*') {
            return Err(CapabilityParseError::Wildcard(s.to_string()));
        }
        let (resource, action) = s
            .split_once('.')
            .ok_or_else(|| CapabilityParseError::BadShape(s.to_string()))?;
        if resource.is_empty() || action.is_empty() || action.contains('.') {
            return Err(CapabilityParseError::BadShape(s.to_string()));
        }
        Ok(Self {
            resource: resource.to_string(),
            action: action.to_string(),
        })
    }

    #[must_use]
    pub fn resource(&self) -> &str {
        &self.resource
    }

    #[must_use]
    pub fn action(&self) -> &str {
        &self.action
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource, self.action)
    }
}

impl TryFrom<String> for Capability {
    type Error = CapabilityParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Capability> for String {
    fn from(cap: Capability) -> Self {
        cap.to_string()
    }
}

/// A set of granted capabilities: exact names plus whole-resource wildcard
/// grants from `action="*"` permission tags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub caps: BTreeSet<Capability>,
    /// Resources granted in full (every action).
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub wildcard_resources: BTreeSet<String>,
}

impl CapabilitySet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&mut self, cap: Capability) {
        self.caps.insert(cap);
    }

    pub fn grant_resource(&mut self, resource: impl Into<String>) {
        self.wildcard_resources.insert(resource.into());
    }

    #[must_use]
    pub fn allows(&self, cap: &Capability) -> bool {
        self.caps.contains(cap) || self.wildcard_resources.contains(cap.resource())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.caps.is_empty() && self.wildcard_resources.is_empty()
    }

    /// Set intersection. A child can never hold a capability its parent
    /// lacked: exact caps survive when the other side allows them, and a
    /// wildcard survives only when both sides hold it.
    #[must_use]
    pub fn intersect(&self, other: &Self) -> Self {
        let mut caps: BTreeSet<Capability> = self
            .caps
            .iter()
            .filter(|c| other.allows(c))
            .cloned()
            .collect();
        caps.extend(other.caps.iter().filter(|c| self.allows(c)).cloned());
        let wildcard_resources = self
            .wildcard_resources
            .intersection(&other.wildcard_resources)
            .cloned()
            .collect();
        Self {
            caps,
            wildcard_resources,
        }
    }

    /// Whether every capability this set can grant is also grantable by
    /// `other`. Used by the monotonicity tests.
    #[must_use]
    pub fn is_subset_of(&self, other: &Self) -> bool {
        self.caps.iter().all(|c| other.allows(c))
            && self
                .wildcard_resources
                .iter()
                .all(|r| other.wildcard_resources.contains(r))
    }
}

/// Action declared by a permission tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionAction {
    Read,
    Write,
    Execute,
    Spawn,
}

/// One declared permission from directive metadata, e.g.
/// `<read resource="filesystem"/>` or `<execute resource="tool" id="bash"/>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSpec {
    pub action: PermissionAction,
    pub resource: String,
    /// Specific target inside the resource; `*` means every target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

//! Core domain types for the kiwi kernel - no IO, no async.

pub mod capability;
pub mod chain;
pub mod directive;
pub mod event;
pub mod failure;
pub mod ids;
pub mod limits;
pub mod lockfile;
pub mod manifest;
pub mod pricing;
pub mod usage;

pub use capability::{Capability, CapabilityParseError, CapabilitySet, PermissionAction, PermissionSpec};
pub use chain::{ChainEntry, MAX_CHAIN_DEPTH, ResolvedChain};
pub use directive::DirectiveSpec;
pub use event::{CheckpointName, Event, HookAction, HookSpec};
pub use failure::FailureKind;
pub use ids::{DirectiveId, ThreadId};
pub use limits::{LimitCode, Limits};
pub use lockfile::{ChainValidation, LOCKFILE_VERSION, Lockfile, RegistryInfo};
pub use manifest::{
    EnvConfig, ExecutorBinding, InterpreterKind, InterpreterSpec, ManifestError, PrimitiveKind,
    SearchRoot, ToolManifest, ToolType,
};
pub use pricing::{ModelPricing, PricingTable};
pub use usage::{CostSnapshot, TurnUsage};

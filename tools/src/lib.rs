//! Tool supply chain: integrity hashing, metadata extraction, executor
//! resolution, chain validation, and lockfiles.

pub mod chain;
pub mod integrity;
pub mod lockfile;
pub mod metadata;
pub mod resolver;
pub mod roots;

pub use chain::validate_chain;
pub use integrity::{IntegrityError, content_hash, parse_signature, verify_signature};
pub use lockfile::{LockfileError, LockfileStore};
pub use metadata::{MetadataError, extract_manifest};
pub use resolver::{ResolveError, resolve_executor};
pub use roots::{Scope, ToolRoots};

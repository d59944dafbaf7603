//! Shared utilities for kiwi: atomic IO, advisory locks, template expansion.

pub mod atomic_write;
pub mod lock;
pub mod redact;
pub mod template;

pub use atomic_write::{AtomicWriteOptions, FileSyncPolicy, PersistMode, atomic_write, atomic_write_with_options, recover_bak_file};
pub use lock::FileLock;
pub use redact::redact_secrets;
pub use template::{expand_map, expand_str};

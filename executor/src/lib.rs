//! Universal executor: recursive chain walk, env resolution, and terminal
//! primitive dispatch.

pub mod config;
pub mod env;
pub mod executor;
pub mod sinks;

pub use config::KernelConfig;
pub use env::resolve_env;
pub use executor::{ExecutionOutcome, ExecutorError, ExecutorOptions, UniversalExecutor};
pub use sinks::{DestinationSpec, instantiate_sinks};

//! The safety harness: checkpoints, cost accounting, hook dispatch, and
//! capability attenuation.

pub mod cost;
pub mod harness;
pub mod hooks;
pub mod registry;

pub use cost::CostLedger;
pub use harness::{
    AUDIENCE, CheckpointOutcome, FinalReport, HarnessError, HarnessShared, HookRunError,
    HookRunner, MAX_HOOK_DEPTH, SafetyHarness,
};
pub use hooks::{CompiledHook, HookCompileError, compile_hooks};
pub use registry::{ThreadRecord, ThreadRegistry, ThreadRegistryError, ThreadStatus};

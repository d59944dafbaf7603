//! The kernel-wide failure taxonomy and its contractual exit codes.
//!
//! Concrete error types live with the crates that raise them; this kind
//! enum is what crosses the harness boundary and what a front-end maps to
//! a process exit code.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Integrity,
    LockfileStale,
    ExecutorNotFound,
    ChainTooDeep,
    ChainInvalid,
    SchemaValidation,
    PermissionDenied,
    LimitExceeded,
    Timeout,
    Primitive,
    HookEvaluation,
    AuthenticationRequired,
    Refresh,
    Io,
    BadInput,
}

impl FailureKind {
    /// Contractual exit code for CLI front-ends.
    #[must_use]
    pub fn exit_code(self) -> i32 {
        match self {
            Self::BadInput
            | Self::SchemaValidation
            | Self::ExecutorNotFound
            | Self::ChainTooDeep
            | Self::HookEvaluation => 64,
            Self::Integrity | Self::LockfileStale | Self::ChainInvalid => 65,
            Self::PermissionDenied => 66,
            Self::Io | Self::AuthenticationRequired | Self::Refresh => 74,
            Self::Timeout => 75,
            Self::Primitive | Self::LimitExceeded => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::FailureKind;

    #[test]
    fn exit_codes_match_the_contract() {
        assert_eq!(FailureKind::BadInput.exit_code(), 64);
        assert_eq!(FailureKind::Integrity.exit_code(), 65);
        assert_eq!(FailureKind::LockfileStale.exit_code(), 65);
        assert_eq!(FailureKind::PermissionDenied.exit_code(), 66);
        assert_eq!(FailureKind::Io.exit_code(), 74);
        assert_eq!(FailureKind::Timeout.exit_code(), 75);
    }
}

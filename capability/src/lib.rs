//! Signed capability tokens.
//!
//! A harness-held Ed25519 keypair signs a compact envelope
//! `{payload, signature}`. Attenuation rebuilds the envelope with the
//! set-intersection of the parent's capabilities and the child's declared
//! permissions, then re-signs; a child can never hold a capability its
//! parent lacked.

mod mapping;
mod token;

pub use mapping::{PermissionMapError, permissions_to_caps};
pub use token::{CapabilityToken, TokenError, TokenPayload, TokenSigner};

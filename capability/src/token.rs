//! Token envelope: mint, verify, attenuate.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use kiwi_types::{CapabilitySet, DirectiveId, PermissionSpec, ThreadId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::mapping::{PermissionMapError, permissions_to_caps};

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("signature verification failed: {0}")]
    BadSignature(String),
    #[error("token envelope is malformed: {0}")]
    Malformed(String),
    #[error("token audience '{actual}' does not match '{expected}'")]
    WrongAudience { expected: String, actual: String },
    #[error("token expired at {0}")]
    Expired(DateTime<Utc>),
    #[error(transparent)]
    Permission(#[from] PermissionMapError),
}

/// The signed claims of a capability token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenPayload {
    pub token_id: Uuid,
    pub caps: CapabilitySet,
    pub aud: String,
    /// Expiry as seconds since the Unix epoch.
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    pub directive_id: DirectiveId,
    pub thread_id: ThreadId,
}

impl TokenPayload {
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }
}

/// An opaque bearer token: base64 payload and signature.
///
/// Immutable once minted; attenuation mints a replacement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityToken {
    pub payload: String,
    pub signature: String,
}

impl CapabilityToken {
    /// Compact single-string form, `payload.signature`.
    #[must_use]
    pub fn compact(&self) -> String {
        format!("{}.{}", self.payload, self.signature)
    }

    pub fn from_compact(s: &str) -> Result<Self, TokenError> {
        let (payload, signature) = s
            .split_once('.')
            .ok_or_else(|| TokenError::Malformed("missing '.' separator".to_string()))?;
        Ok(Self {
            payload: payload.to_string(),
            signature: signature.to_string(),
        })
    }

    /// Decode the claims without verifying. Use [`TokenSigner::verify`] for
    /// anything security-relevant.
    pub fn peek(&self) -> Result<TokenPayload, TokenError> {
        let bytes = STANDARD
            .decode(&self.payload)
            .map_err(|e| TokenError::Malformed(format!("invalid base64 payload: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| TokenError::Malformed(format!("invalid payload JSON: {e}")))
    }
}

/// The harness-held signing key.
pub struct TokenSigner {
    key: SigningKey,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner").finish_non_exhaustive()
    }
}

impl TokenSigner {
    /// Generate a fresh keypair. One signer lives for one kernel process.
    #[must_use]
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        Self {
            key: SigningKey::generate(&mut csprng),
        }
    }

    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// Mint a token from a directive's declared permissions.
    pub fn mint(
        &self,
        permissions: &[PermissionSpec],
        aud: &str,
        expires_at: DateTime<Utc>,
        directive_id: DirectiveId,
        thread_id: ThreadId,
    ) -> Result<CapabilityToken, TokenError> {
        let caps = permissions_to_caps(permissions)?;
        self.sign_payload(TokenPayload {
            token_id: Uuid::new_v4(),
            caps,
            aud: aud.to_string(),
            exp: expires_at.timestamp(),
            parent_id: None,
            directive_id,
            thread_id,
        })
    }

    /// Mint a child token: the parent's capabilities intersected with the
    /// child's declared permissions. The parent token must verify first.
    pub fn attenuate(
        &self,
        parent: &CapabilityToken,
        child_permissions: &[PermissionSpec],
        directive_id: DirectiveId,
        thread_id: ThreadId,
    ) -> Result<CapabilityToken, TokenError> {
        let parent_payload = self.verify_claims(parent)?;
        let requested = permissions_to_caps(child_permissions)?;
        let caps = parent_payload.caps.intersect(&requested);
        tracing::debug!(
            parent = %parent_payload.token_id,
            thread = %thread_id,
            "attenuated capability token"
        );
        self.sign_payload(TokenPayload {
            token_id: Uuid::new_v4(),
            caps,
            aud: parent_payload.aud.clone(),
            exp: parent_payload.exp,
            parent_id: Some(parent_payload.token_id),
            directive_id,
            thread_id,
        })
    }

    /// Verify signature, audience, and expiry; return the claims.
    pub fn verify(&self, token: &CapabilityToken, aud: &str) -> Result<TokenPayload, TokenError> {
        let payload = self.verify_claims(token)?;
        if payload.aud != aud {
            return Err(TokenError::WrongAudience {
                expected: aud.to_string(),
                actual: payload.aud,
            });
        }
        Ok(payload)
    }

    /// Verify signature and expiry only (audience checked by the caller).
    fn verify_claims(&self, token: &CapabilityToken) -> Result<TokenPayload, TokenError> {
        let payload_bytes = STANDARD
            .decode(&token.payload)
            .map_err(|e| TokenError::Malformed(format!("invalid base64 payload: {e}")))?;
        let sig_bytes = STANDARD
            .decode(&token.signature)
            .map_err(|e| TokenError::Malformed(format!("invalid base64 signature: {e}")))?;
        let sig_bytes: [u8; 64] = sig_bytes
            .try_into()
            .map_err(|_| TokenError::Malformed("signature must be 64 bytes".to_string()))?;
        let signature = Signature::from_bytes(&sig_bytes);

        self.key
            .verifying_key()
            .verify(&payload_bytes, &signature)
            .map_err(|e| TokenError::BadSignature(e.to_string()))?;

        let payload: TokenPayload = serde_json::from_slice(&payload_bytes)
            .map_err(|e| TokenError::Malformed(format!("invalid payload JSON: {e}")))?;

        if payload.exp <= Utc::now().timestamp() {
            return Err(TokenError::Expired(
                payload.expires_at().unwrap_or(DateTime::<Utc>::MIN_UTC),
            ));
        }
        Ok(payload)
    }

    fn sign_payload(&self, payload: TokenPayload) -> Result<CapabilityToken, TokenError> {
        let bytes = serde_json::to_vec(&payload)
            .map_err(|e| TokenError::Malformed(format!("payload serialization: {e}")))?;
        let signature = self.key.sign(&bytes);
        Ok(CapabilityToken {
            payload: STANDARD.encode(&bytes),
            signature: STANDARD.encode(signature.to_bytes()),
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use kiwi_types::{Capability, DirectiveId, PermissionAction, PermissionSpec, ThreadId};

    use super::{CapabilityToken, TokenError, TokenSigner};

    fn spec(action: PermissionAction, resource: &str, id: Option<&str>) -> PermissionSpec {
        PermissionSpec {
            action,
            resource: resource.to_string(),
            id: id.map(ToString::to_string),
        }
    }

    fn read_fs() -> PermissionSpec {
        spec(PermissionAction::Read, "filesystem", None)
    }

    fn mint(signer: &TokenSigner, perms: &[PermissionSpec]) -> CapabilityToken {
        signer
            .mint(
                perms,
                "kiwi-kernel",
                Utc::now() + Duration::hours(1),
                DirectiveId::new("root"),
                ThreadId::new(),
            )
            .expect("mint")
    }

    #[test]
    fn mint_then_verify_round_trips() {
        let signer = TokenSigner::generate();
        let token = mint(&signer, &[read_fs()]);
        let payload = signer.verify(&token, "kiwi-kernel").expect("verify");
        assert!(payload.caps.allows(&Capability::parse("fs.read").unwrap()));
        assert!(payload.parent_id.is_none());
    }

    #[test]
    fn wrong_audience_is_rejected() {
        let signer = TokenSigner::generate();
        let token = mint(&signer, &[read_fs()]);
        assert!(matches!(
            signer.verify(&token, "other-kernel"),
            Err(TokenError::WrongAudience { .. })
        ));
    }

    #[test]
    fn foreign_key_signature_is_rejected() {
        let signer = TokenSigner::generate();
        let other = TokenSigner::generate();
        let token = mint(&signer, &[read_fs()]);
        assert!(matches!(
            other.verify(&token, "kiwi-kernel"),
            Err(TokenError::BadSignature(_))
        ));
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let signer = TokenSigner::generate();
        let mut token = mint(&signer, &[read_fs()]);
        // Re-encode a widened payload without re-signing.
        let mut payload = token.peek().expect("peek");
        payload
            .caps
            .grant(Capability::parse("fs.write").unwrap());
        token.payload = base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            serde_json::to_vec(&payload).unwrap(),
        );
        assert!(matches!(
            signer.verify(&token, "kiwi-kernel"),
            Err(TokenError::BadSignature(_))
        ));
    }

    #[test]
    fn expired_token_is_rejected() {
        let signer = TokenSigner::generate();
        let token = signer
            .mint(
                &[read_fs()],
                "kiwi-kernel",
                Utc::now() - Duration::seconds(5),
                DirectiveId::new("root"),
                ThreadId::new(),
            )
            .expect("mint");
        assert!(matches!(
            signer.verify(&token, "kiwi-kernel"),
            Err(TokenError::Expired(_))
        ));
    }

    #[test]
    fn attenuation_is_pure_intersection() {
        let signer = TokenSigner::generate();
        let parent = mint(&signer, &[read_fs()]);

        // Child asks for read and write; only read survives.
        let child = signer
            .attenuate(
                &parent,
                &[read_fs(), spec(PermissionAction::Write, "filesystem", None)],
                DirectiveId::new("hook"),
                ThreadId::new(),
            )
            .expect("attenuate");
        let payload = signer.verify(&child, "kiwi-kernel").expect("verify child");
        assert!(payload.caps.allows(&Capability::parse("fs.read").unwrap()));
        assert!(!payload.caps.allows(&Capability::parse("fs.write").unwrap()));
        assert!(payload.parent_id.is_some());
    }

    #[test]
    fn attenuation_chain_is_monotonic() {
        let signer = TokenSigner::generate();
        let root = mint(
            &signer,
            &[
                read_fs(),
                spec(PermissionAction::Execute, "tool", Some("*")),
                spec(PermissionAction::Spawn, "thread", None),
            ],
        );
        let mid = signer
            .attenuate(
                &root,
                &[
                    read_fs(),
                    spec(PermissionAction::Execute, "tool", Some("bash")),
                ],
                DirectiveId::new("mid"),
                ThreadId::new(),
            )
            .expect("mid");
        let leaf = signer
            .attenuate(
                &mid,
                &[
                    spec(PermissionAction::Execute, "tool", Some("bash")),
                    spec(PermissionAction::Spawn, "thread", None),
                ],
                DirectiveId::new("leaf"),
                ThreadId::new(),
            )
            .expect("leaf");

        let root_caps = signer.verify(&root, "kiwi-kernel").unwrap().caps;
        let mid_caps = signer.verify(&mid, "kiwi-kernel").unwrap().caps;
        let leaf_caps = signer.verify(&leaf, "kiwi-kernel").unwrap().caps;
        assert!(mid_caps.is_subset_of(&root_caps));
        assert!(leaf_caps.is_subset_of(&mid_caps));
        // spawn.thread was dropped by mid, so leaf cannot regain it
        assert!(!leaf_caps.allows(&Capability::parse("spawn.thread").unwrap()));
    }

    #[test]
    fn compact_form_round_trips() {
        let signer = TokenSigner::generate();
        let token = mint(&signer, &[read_fs()]);
        let parsed = CapabilityToken::from_compact(&token.compact()).expect("parse");
        assert_eq!(parsed, token);
    }
}

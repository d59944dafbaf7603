//! OS-keychain-backed token cache with scope and refresh.
//!
//! Secrets live in the platform keychain; the store keeps only non-secret
//! metadata (expiry, scopes) in memory. Expired tokens are refreshed through
//! a registered refresh procedure using the persisted refresh token.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("not authenticated for service '{service}'")]
    AuthenticationRequired { service: String },
    #[error("token refresh failed for service '{service}': {message}")]
    Refresh { service: String, message: String },
    #[error("keychain access failed: {0}")]
    Keychain(String),
}

/// Result of a successful refresh procedure.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access: String,
    pub refresh: Option<String>,
    pub expires_in: u64,
    pub scopes: Vec<String>,
}

/// The registered refresh procedure. Called with the persisted refresh
/// token when an access token has expired.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(
        &self,
        service: &str,
        scope: Option<&str>,
        refresh_token: &str,
    ) -> Result<RefreshedToken, AuthError>;
}

/// Secret persistence seam. The production implementation is the OS
/// keychain; tests substitute an in-memory map.
pub trait SecretStore: Send + Sync {
    fn set(&self, key: &str, value: &str) -> Result<(), AuthError>;
    /// `Ok(None)` when no secret is stored under `key`.
    fn get(&self, key: &str) -> Result<Option<String>, AuthError>;
    fn delete(&self, key: &str) -> Result<(), AuthError>;
}

/// Platform keychain implementation.
pub struct KeychainStore {
    namespace: String,
}

impl KeychainStore {
    #[must_use]
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<keyring::Entry, AuthError> {
        keyring::Entry::new(&self.namespace, key).map_err(|e| AuthError::Keychain(e.to_string()))
    }
}

impl SecretStore for KeychainStore {
    fn set(&self, key: &str, value: &str) -> Result<(), AuthError> {
        self.entry(key)?
            .set_password(value)
            .map_err(|e| AuthError::Keychain(e.to_string()))
    }

    fn get(&self, key: &str) -> Result<Option<String>, AuthError> {
        match self.entry(key)?.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(AuthError::Keychain(e.to_string())),
        }
    }

    fn delete(&self, key: &str) -> Result<(), AuthError> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(AuthError::Keychain(e.to_string())),
        }
    }
}

/// Non-secret metadata kept in memory per `(service, scope)`.
#[derive(Debug, Clone)]
struct TokenMeta {
    expires_at: DateTime<Utc>,
    scopes: Vec<String>,
}

/// Token cache keyed by `(service, scope?)`.
pub struct AuthStore {
    secrets: Arc<dyn SecretStore>,
    meta: Mutex<HashMap<String, TokenMeta>>,
    refresher: Option<Arc<dyn TokenRefresher>>,
    /// Refresh this long before nominal expiry.
    expiry_slack: Duration,
}

fn cache_key(service: &str, scope: Option<&str>) -> String {
    match scope {
        Some(scope) => format!("{service}/{scope}"),
        None => service.to_string(),
    }
}

impl AuthStore {
    #[must_use]
    pub fn new(secrets: Arc<dyn SecretStore>) -> Self {
        Self {
            secrets,
            meta: Mutex::new(HashMap::new()),
            refresher: None,
            expiry_slack: Duration::seconds(30),
        }
    }

    /// The default store backed by the OS keychain.
    #[must_use]
    pub fn keychain() -> Self {
        Self::new(Arc::new(KeychainStore::new("kiwi")))
    }

    #[must_use]
    pub fn with_refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    /// Persist a token pair. Only expiry and scopes are cached in memory.
    pub async fn set_token(
        &self,
        service: &str,
        scope: Option<&str>,
        access: &str,
        refresh: Option<&str>,
        expires_in: u64,
        scopes: Vec<String>,
    ) -> Result<(), AuthError> {
        let key = cache_key(service, scope);
        self.secrets.set(&format!("{key}:access"), access)?;
        if let Some(refresh) = refresh {
            self.secrets.set(&format!("{key}:refresh"), refresh)?;
        }
        let expires_at = Utc::now() + Duration::seconds(expires_in as i64);
        self.meta
            .lock()
            .await
            .insert(key, TokenMeta { expires_at, scopes });
        Ok(())
    }

    /// Return a valid access token, refreshing if the cached one expired.
    pub async fn get_token(&self, service: &str, scope: Option<&str>) -> Result<String, AuthError> {
        let key = cache_key(service, scope);
        let expired = {
            let meta = self.meta.lock().await;
            match meta.get(&key) {
                Some(m) => m.expires_at - self.expiry_slack <= Utc::now(),
                // No metadata: a token may still be persisted from a prior
                // process; treat it as usable and let the caller's first
                // failure trigger refresh.
                None => false,
            }
        };

        if !expired {
            if let Some(access) = self.secrets.get(&format!("{key}:access"))? {
                return Ok(access);
            }
        }
        self.refresh_token(service, scope).await
    }

    /// Presence and expiry check without touching the keychain when the
    /// metadata cache can answer.
    pub async fn is_authenticated(&self, service: &str, scope: Option<&str>) -> bool {
        let key = cache_key(service, scope);
        if let Some(m) = self.meta.lock().await.get(&key) {
            return m.expires_at > Utc::now();
        }
        matches!(self.secrets.get(&format!("{key}:access")), Ok(Some(_)))
    }

    /// Scopes recorded for the cached token, if any.
    pub async fn scopes(&self, service: &str, scope: Option<&str>) -> Vec<String> {
        let key = cache_key(service, scope);
        self.meta
            .lock()
            .await
            .get(&key)
            .map(|m| m.scopes.clone())
            .unwrap_or_default()
    }

    /// Remove persisted secrets and cached metadata.
    pub async fn clear_token(&self, service: &str, scope: Option<&str>) -> Result<(), AuthError> {
        let key = cache_key(service, scope);
        self.secrets.delete(&format!("{key}:access"))?;
        self.secrets.delete(&format!("{key}:refresh"))?;
        self.meta.lock().await.remove(&key);
        Ok(())
    }

    async fn refresh_token(&self, service: &str, scope: Option<&str>) -> Result<String, AuthError> {
        let key = cache_key(service, scope);
        let refresher = self
            .refresher
            .as_ref()
            .ok_or_else(|| AuthError::AuthenticationRequired {
                service: service.to_string(),
            })?;
        let refresh = self
            .secrets
            .get(&format!("{key}:refresh"))?
            .ok_or_else(|| AuthError::AuthenticationRequired {
                service: service.to_string(),
            })?;

        debug!(service, ?scope, "refreshing expired access token");
        let refreshed = refresher.refresh(service, scope, &refresh).await?;
        self.set_token(
            service,
            scope,
            &refreshed.access,
            refreshed.refresh.as_deref(),
            refreshed.expires_in,
            refreshed.scopes.clone(),
        )
        .await?;
        Ok(refreshed.access)
    }
}

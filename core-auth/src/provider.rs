//! Credential Provider
//!
//! The archive core asks a [`CredentialProvider`] for the credential of a
//! source and never acquires credentials itself. [`StoredCredentialProvider`]
//! keeps credentials in the host's [`SecureStore`] and delegates OAuth
//! refresh to an optional [`TokenRefresher`].
//!
//! ## Example
//!
//! ```no_run
//! use core_auth::{Credential, CredentialProvider, StoredCredentialProvider};
//! use std::sync::Arc;
//! # use bridge_traits::storage::SecureStore;
//! # async fn example(secure_store: Arc<dyn SecureStore>) -> core_auth::Result<()> {
//! let provider = StoredCredentialProvider::new(secure_store);
//!
//! provider
//!     .save(&Credential::password("imap:alice@example.com", "alice", "app-password"))
//!     .await?;
//!
//! let credential = provider.get_valid("imap:alice@example.com").await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{AuthError, Result};
use crate::types::Credential;
use async_trait::async_trait;
use bridge_traits::storage::SecureStore;
use std::sync::Arc;
use core_runtime::logging::redact_if_sensitive;
use tracing::{debug, info, warn};

const KEY_PREFIX: &str = "credential/";

/// Source of credentials for mail sources.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Stored credential for `source`, if any.
    async fn get_token(&self, source: &str) -> Result<Option<Credential>>;

    /// Exchange an expired credential for a fresh one.
    async fn refresh(&self, credential: &Credential) -> Result<Credential>;

    /// Persist a credential, replacing any previous one for its source.
    async fn save(&self, credential: &Credential) -> Result<()>;

    /// Credential for `source`, refreshed and re-saved first when expired.
    ///
    /// # Errors
    ///
    /// `AuthError::NotAuthenticated` when nothing is stored or the stored
    /// credential is unusable and cannot be refreshed.
    async fn get_valid(&self, source: &str) -> Result<Credential> {
        let credential = self
            .get_token(source)
            .await?
            .ok_or_else(|| AuthError::NotAuthenticated(source.to_string()))?;

        if credential.is_valid() {
            return Ok(credential);
        }

        if !credential.can_refresh() {
            return Err(AuthError::NotAuthenticated(source.to_string()));
        }

        info!(source = source, "Refreshing expired credential");
        let refreshed = self.refresh(&credential).await?;
        self.save(&refreshed).await?;
        Ok(refreshed)
    }
}

/// Performs the OAuth refresh-token exchange for a source.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, credential: &Credential) -> Result<Credential>;
}

/// Credential provider backed by a platform secure store.
///
/// Credentials are serialized to JSON under `credential/<source>`. Corrupted
/// entries are deleted on read so the next login starts clean.
#[derive(Clone)]
pub struct StoredCredentialProvider {
    secure_store: Arc<dyn SecureStore>,
    refresher: Option<Arc<dyn TokenRefresher>>,
}

impl StoredCredentialProvider {
    pub fn new(secure_store: Arc<dyn SecureStore>) -> Self {
        Self {
            secure_store,
            refresher: None,
        }
    }

    /// Attach the refresher used for expired OAuth credentials.
    pub fn with_refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    fn storage_key(source: &str) -> String {
        format!("{}{}", KEY_PREFIX, source)
    }

    /// Remove the stored credential for `source`. Idempotent.
    pub async fn delete(&self, source: &str) -> Result<()> {
        self.secure_store
            .delete_secret(&Self::storage_key(source))
            .await
            .map_err(|e| {
                warn!(source = source, error = %e, "Failed to delete credential");
                AuthError::SecureStorageUnavailable(e.to_string())
            })?;

        info!(source = source, "Credential deleted");
        Ok(())
    }
}

#[async_trait]
impl CredentialProvider for StoredCredentialProvider {
    async fn get_token(&self, source: &str) -> Result<Option<Credential>> {
        let key = Self::storage_key(source);

        let data = self.secure_store.get_secret(&key).await.map_err(|e| {
            warn!(source = source, error = %e, "Failed to read credential");
            AuthError::SecureStorageUnavailable(e.to_string())
        })?;

        let Some(data) = data else {
            debug!(source = source, "No credential stored");
            return Ok(None);
        };

        match serde_json::from_slice::<Credential>(&data) {
            Ok(credential) => Ok(Some(credential)),
            Err(e) => {
                warn!(
                    source = source,
                    error = %e,
                    "Stored credential is corrupted, deleting it"
                );

                if let Err(delete_err) = self.secure_store.delete_secret(&key).await {
                    warn!(source = source, error = %delete_err, "Failed to delete corrupted credential");
                }

                Err(AuthError::CredentialCorrupted {
                    source_name: source.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn refresh(&self, credential: &Credential) -> Result<Credential> {
        if !credential.can_refresh() {
            return Err(AuthError::TokenRefreshFailed(format!(
                "credential for {} has no refresh token",
                credential.source
            )));
        }

        let refresher = self.refresher.as_ref().ok_or_else(|| {
            AuthError::TokenRefreshFailed("no token refresher configured".to_string())
        })?;

        let refreshed = refresher.refresh(credential).await?;

        if refreshed.source != credential.source {
            return Err(AuthError::TokenRefreshFailed(format!(
                "refresher returned a credential for {} instead of {}",
                refreshed.source, credential.source
            )));
        }

        debug!(source = %redact_if_sensitive("source", &credential.source), "Credential refreshed");
        Ok(refreshed)
    }

    async fn save(&self, credential: &Credential) -> Result<()> {
        let json = serde_json::to_vec(credential)
            .map_err(|e| AuthError::SerializationFailed(e.to_string()))?;

        self.secure_store
            .set_secret(&Self::storage_key(&credential.source), &json)
            .await
            .map_err(|e| {
                warn!(source = %redact_if_sensitive("source", &credential.source), error = %e, "Failed to store credential");
                AuthError::SecureStorageUnavailable(e.to_string())
            })?;

        info!(
            source = %redact_if_sensitive("source", &credential.source),
            can_refresh = credential.can_refresh(),
            "Credential stored securely"
        );
        Ok(())
    }
}

//! Secret Storage Abstraction
//!
//! OAuth tokens and IMAP app passwords are persisted through this seam so
//! the core never talks to a platform keychain directly.

use async_trait::async_trait;

use crate::error::Result;

/// Byte-oriented secret store keyed by string.
///
/// Desktop hosts back it with the OS keychain (Keychain, Credential
/// Manager, Secret Service). Values must never appear in logs or error
/// messages.
#[async_trait]
pub trait SecureStore: Send + Sync {
    /// Write `value` under `key`, overwriting what was there.
    async fn set_secret(&self, key: &str, value: &[u8]) -> Result<()>;

    /// `Ok(None)` when nothing is stored under `key`.
    async fn get_secret(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Removing an absent key succeeds.
    async fn delete_secret(&self, key: &str) -> Result<()>;

    async fn has_secret(&self, key: &str) -> Result<bool> {
        Ok(self.get_secret(key).await?.is_some())
    }
}

//! `SecureStore` over the OS keychain.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bridge_traits::{
    error::{BridgeError, Result},
    storage::SecureStore,
};
use keyring::Entry;
use tracing::debug;

/// Keychain service the entries are filed under
pub const SERVICE_NAME: &str = "mailvault";

/// Keychain-backed secret store (Keychain, Credential Manager, Secret
/// Service).
///
/// Keychain entries hold text, so secrets are stored base64-encoded.
#[derive(Debug, Clone)]
pub struct KeyringSecureStore {
    service: String,
}

impl KeyringSecureStore {
    pub fn new() -> Self {
        Self::for_service(SERVICE_NAME)
    }

    /// Separate keychain namespace, e.g. for test runs.
    pub fn for_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry> {
        Entry::new(&self.service, key).map_err(keyring_error)
    }
}

impl Default for KeyringSecureStore {
    fn default() -> Self {
        Self::new()
    }
}

fn keyring_error(e: keyring::Error) -> BridgeError {
    BridgeError::SecretStore(format!("keyring: {}", e))
}

fn decode(key: &str, stored: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(stored)
        .map_err(|e| BridgeError::SecretStore(format!("entry {} is not valid base64: {}", key, e)))
}

#[async_trait]
impl SecureStore for KeyringSecureStore {
    async fn set_secret(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entry(key)?
            .set_password(&STANDARD.encode(value))
            .map_err(keyring_error)?;
        debug!(key, "Secret stored");
        Ok(())
    }

    async fn get_secret(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.entry(key)?.get_password() {
            Ok(stored) => decode(key, &stored).map(Some),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(keyring_error(e)),
        }
    }

    async fn delete_secret(&self, key: &str) -> Result<()> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(keyring_error(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_rejects_foreign_entries() {
        assert_eq!(decode("k", &STANDARD.encode(b"app-password")).unwrap(), b"app-password");
        assert!(matches!(
            decode("k", "not base64!"),
            Err(BridgeError::SecretStore(_))
        ));
    }

    #[tokio::test]
    async fn test_round_trip_when_keychain_present() {
        let store = KeyringSecureStore::for_service("mailvault-test");
        let key = "credential/imap:test@example.org";

        // Headless machines often have no secret service.
        if store.set_secret(key, b"app-password").await.is_err() {
            return;
        }

        if let Ok(Some(value)) = store.get_secret(key).await {
            assert_eq!(value, b"app-password");
        }
        store.delete_secret(key).await.unwrap();
        assert!(store.delete_secret(key).await.is_ok());
    }
}

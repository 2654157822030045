//! # Archive Configuration Module
//!
//! Provides configuration management for the mail archive core.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct an
//! `ArchiveConfig` holding the archive paths, the sync options the engine
//! reads, and the host bridges it needs. `build()` fails fast when a required
//! bridge is missing or an option is out of range.
//!
//! ## Required Dependencies
//!
//! - `SecureStore` - credential persistence
//!
//! ## Optional Dependencies (with platform defaults)
//!
//! - `HttpClient` - only needed by REST sources (desktop default: reqwest)
//!
//! With the `desktop-shims` feature both are filled in from `bridge-desktop`
//! when not provided.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::ArchiveConfig;
//!
//! let config = ArchiveConfig::builder()
//!     .archive_root("/srv/mail")
//!     .batch_size(25)
//!     .exclude_folder("Junk")
//!     .build()?;
//! ```
//!
//! `SyncOptions` derives `Deserialize`, so hosts can read it from whatever
//! config file format they use and hand it to
//! [`ArchiveConfigBuilder::sync_options`].

use crate::error::{Error, Result};
use bridge_traits::{HttpClient, RetryPolicy, SecureStore};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Database file name used when no explicit path is configured.
pub const DEFAULT_DATABASE_FILE: &str = "archive.db";

/// Upper bound for `batch_size`.
pub const MAX_BATCH_SIZE: usize = 500;

/// Options read by the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncOptions {
    /// Fetch labels and inject them as a synthetic header
    pub include_labels: bool,

    /// Folders skipped entirely by folder-scan sources
    pub exclude_folders: Vec<String>,

    /// Folder known to contain every message exactly once. Selects the
    /// authoritative-source dedup strategy when set.
    pub authoritative_folder: Option<String>,

    /// Items per fetch batch and per metadata commit
    pub batch_size: usize,

    /// Bound on parallel network fetches inside one batch
    pub max_concurrent_fetches: usize,

    /// Attempts for a rate-limited batch, including the first
    pub retry_max_attempts: u32,

    /// Base delay of the exponential backoff
    pub retry_base_delay_ms: u64,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            include_labels: true,
            exclude_folders: vec!["[Gmail]/Trash".to_string(), "[Gmail]/Spam".to_string()],
            authoritative_folder: None,
            batch_size: 10,
            max_concurrent_fetches: 8,
            retry_max_attempts: 5,
            retry_base_delay_ms: 1000,
        }
    }
}

impl SyncOptions {
    /// Validates option ranges.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config(
                "Batch size must be greater than 0".to_string(),
            ));
        }

        if self.batch_size > MAX_BATCH_SIZE {
            return Err(Error::Config(format!(
                "Batch size exceeds maximum of {}",
                MAX_BATCH_SIZE
            )));
        }

        if self.max_concurrent_fetches == 0 {
            return Err(Error::Config(
                "max_concurrent_fetches must be greater than 0".to_string(),
            ));
        }

        if self.retry_max_attempts == 0 {
            return Err(Error::Config(
                "retry_max_attempts must be at least 1".to_string(),
            ));
        }

        if let Some(folder) = &self.authoritative_folder {
            if folder.trim().is_empty() {
                return Err(Error::Config(
                    "Authoritative folder cannot be empty".to_string(),
                ));
            }
            if self.is_excluded(folder) {
                return Err(Error::Config(format!(
                    "Authoritative folder '{}' is also excluded",
                    folder
                )));
            }
        }

        Ok(())
    }

    /// Backoff policy for rate-limited batches.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_max_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
        )
    }

    /// Whether `folder` is configured as excluded.
    pub fn is_excluded(&self, folder: &str) -> bool {
        self.exclude_folders.iter().any(|f| f == folder)
    }
}

/// Core configuration for the mail archive.
///
/// Use [`ArchiveConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct ArchiveConfig {
    /// Root directory of the on-disk archive
    pub archive_root: PathBuf,

    /// Path to the SQLite metadata store
    pub database_path: PathBuf,

    /// Options read by the sync engine
    pub sync: SyncOptions,

    /// HTTP client for REST sources (optional)
    pub http_client: Option<Arc<dyn HttpClient>>,

    /// Secure credential storage (required)
    pub secure_store: Arc<dyn SecureStore>,
}

impl std::fmt::Debug for ArchiveConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveConfig")
            .field("archive_root", &self.archive_root)
            .field("database_path", &self.database_path)
            .field("sync", &self.sync)
            .field(
                "http_client",
                &self.http_client.as_ref().map(|_| "HttpClient { ... }"),
            )
            .field("secure_store", &"SecureStore { ... }")
            .finish()
    }
}

impl ArchiveConfig {
    /// Creates a new builder for constructing an `ArchiveConfig`.
    pub fn builder() -> ArchiveConfigBuilder {
        ArchiveConfigBuilder::default()
    }

    /// Validates the configuration and returns an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.archive_root.as_os_str().is_empty() {
            return Err(Error::Config("Archive root cannot be empty".to_string()));
        }

        if self.database_path.as_os_str().is_empty() {
            return Err(Error::Config("Database path cannot be empty".to_string()));
        }

        self.sync.validate()
    }

    /// HTTP client, or a [`Error::MissingBridge`] naming what needs it.
    pub fn require_http_client(&self, needed_by: &str) -> Result<Arc<dyn HttpClient>> {
        self.http_client
            .clone()
            .ok_or_else(|| Error::MissingBridge {
                bridge: "HttpClient",
                hint: format!(
                    "required by {}; inject one or build with 'desktop-shims'",
                    needed_by
                ),
            })
    }
}

#[cfg(not(feature = "desktop-shims"))]
fn secure_store_missing_error() -> Error {
    Error::MissingBridge {
        bridge: "SecureStore",
        hint: "credentials cannot be persisted; inject one or build with 'desktop-shims'"
            .to_string(),
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_secure_store() -> Result<Arc<dyn SecureStore>> {
    use bridge_desktop::KeyringSecureStore;

    let store: Arc<dyn SecureStore> = Arc::new(KeyringSecureStore::new());
    Ok(store)
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_secure_store() -> Result<Arc<dyn SecureStore>> {
    Err(secure_store_missing_error())
}

#[cfg(feature = "desktop-shims")]
fn provide_default_http_client() -> Option<Arc<dyn HttpClient>> {
    use bridge_desktop::ReqwestHttpClient;

    match ReqwestHttpClient::new() {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            tracing::warn!(error = %e, "Default HTTP client unavailable");
            None
        }
    }
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_http_client() -> Option<Arc<dyn HttpClient>> {
    None
}

/// Builder for constructing [`ArchiveConfig`] instances.
#[derive(Default)]
pub struct ArchiveConfigBuilder {
    archive_root: Option<PathBuf>,
    database_path: Option<PathBuf>,
    sync: Option<SyncOptions>,
    include_labels: Option<bool>,
    exclude_folders: Option<Vec<String>>,
    authoritative_folder: Option<String>,
    batch_size: Option<usize>,
    max_concurrent_fetches: Option<usize>,
    retry: Option<(u32, u64)>,
    http_client: Option<Arc<dyn HttpClient>>,
    secure_store: Option<Arc<dyn SecureStore>>,
}

impl ArchiveConfigBuilder {
    /// Sets the archive root directory (required).
    pub fn archive_root<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.archive_root = Some(path.into());
        self
    }

    /// Sets the metadata database path.
    ///
    /// Default: `<archive_root>/archive.db`
    pub fn database_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// Replaces all sync options at once. Individual setters called on the
    /// builder still take precedence.
    pub fn sync_options(mut self, options: SyncOptions) -> Self {
        self.sync = Some(options);
        self
    }

    pub fn include_labels(mut self, include: bool) -> Self {
        self.include_labels = Some(include);
        self
    }

    /// Replaces the excluded folder list.
    pub fn exclude_folders<I, S>(mut self, folders: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_folders = Some(folders.into_iter().map(Into::into).collect());
        self
    }

    /// Adds one folder to the excluded list (on top of the defaults).
    pub fn exclude_folder(mut self, folder: impl Into<String>) -> Self {
        let folders = self
            .exclude_folders
            .get_or_insert_with(|| SyncOptions::default().exclude_folders);
        folders.push(folder.into());
        self
    }

    pub fn authoritative_folder(mut self, folder: impl Into<String>) -> Self {
        self.authoritative_folder = Some(folder.into());
        self
    }

    /// Items per fetch batch and per commit. Default: 10
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Parallel fetch bound. Default: 8
    pub fn max_concurrent_fetches(mut self, limit: usize) -> Self {
        self.max_concurrent_fetches = Some(limit);
        self
    }

    /// Rate-limit backoff: attempts and base delay in milliseconds.
    pub fn retry(mut self, max_attempts: u32, base_delay_ms: u64) -> Self {
        self.retry = Some((max_attempts, base_delay_ms));
        self
    }

    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn secure_store(mut self, store: Arc<dyn SecureStore>) -> Self {
        self.secure_store = Some(store);
        self
    }

    /// Builds and validates the final [`ArchiveConfig`].
    ///
    /// # Errors
    ///
    /// - `Error::Config` when `archive_root` is missing or an option is out of range
    /// - `Error::MissingBridge` when no `SecureStore` is available
    pub fn build(self) -> Result<ArchiveConfig> {
        let archive_root = self
            .archive_root
            .ok_or_else(|| Error::Config("Archive root is required".to_string()))?;

        let database_path = self
            .database_path
            .unwrap_or_else(|| archive_root.join(DEFAULT_DATABASE_FILE));

        let mut sync = self.sync.unwrap_or_default();
        if let Some(include) = self.include_labels {
            sync.include_labels = include;
        }
        if let Some(folders) = self.exclude_folders {
            sync.exclude_folders = folders;
        }
        if let Some(folder) = self.authoritative_folder {
            sync.authoritative_folder = Some(folder);
        }
        if let Some(size) = self.batch_size {
            sync.batch_size = size;
        }
        if let Some(limit) = self.max_concurrent_fetches {
            sync.max_concurrent_fetches = limit;
        }
        if let Some((attempts, delay_ms)) = self.retry {
            sync.retry_max_attempts = attempts;
            sync.retry_base_delay_ms = delay_ms;
        }

        let secure_store = match self.secure_store {
            Some(store) => store,
            None => provide_default_secure_store()?,
        };

        let http_client = self.http_client.or_else(provide_default_http_client);

        let config = ArchiveConfig {
            archive_root,
            database_path,
            sync,
            http_client,
            secure_store,
        };

        config.validate()?;
        Ok(config)
    }
}

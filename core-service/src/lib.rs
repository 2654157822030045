//! Core service façade.
//!
//! This crate wires an [`ArchiveConfig`] (paths, sync options and the
//! host-provided bridges) into the metadata store, the sync coordinator and
//! the reconciler, and exposes the archive operations hosts call: sync,
//! search, verify, sync check, reindex, label update and stats.
//!
//! Desktop hosts enable the `desktop-shims` feature to get the keyring
//! secure store and the reqwest HTTP client by default. The `gmail` and
//! `imap` features add source constructors for the respective providers.
//!
//! ```ignore
//! use core_runtime::config::ArchiveConfig;
//! use core_service::ArchiveService;
//! use core_sync::{DateRange, RunContext};
//!
//! let config = ArchiveConfig::builder().archive_root("/srv/mail").build()?;
//! let service = ArchiveService::open(config).await?;
//! let summary = service
//!     .sync_gmail("alice@example.com", &DateRange::default(), &RunContext::new())
//!     .await?;
//! ```

pub mod error;

pub use error::{Result, ServiceError};

use std::sync::Arc;

use core_archive::{ArchiveStats, MetadataStore, SearchHit, SearchOptions};
use core_auth::{CredentialProvider, StoredCredentialProvider};
use core_runtime::config::ArchiveConfig;
use core_runtime::logging::redact_if_sensitive;
use core_sync::{
    DateRange, LabelUpdateReport, PipelineReport, Reconciler, RunContext, RunSummary, SourceAdapter,
    SyncCheckReport, SyncCoordinator, VerifyOptions, VerifyReport,
};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

#[cfg(feature = "gmail")]
pub use provider_gmail::GmailSource;
#[cfg(feature = "imap")]
pub use provider_imap::{ImapServer, ImapSource};

/// Primary façade exposed to host applications.
///
/// Runs that write to the archive (sync, reindex, verify, label update) are serialized
/// through an in-process lock; searches and stats read concurrently.
pub struct ArchiveService {
    config: ArchiveConfig,
    store: MetadataStore,
    credentials: Arc<dyn CredentialProvider>,
    coordinator: SyncCoordinator,
    reconciler: Reconciler,
    run_lock: Mutex<()>,
}

impl ArchiveService {
    /// Open (or create) the archive described by `config`.
    ///
    /// Credentials are read from the configured secure store.
    pub async fn open(config: ArchiveConfig) -> Result<Self> {
        config.validate()?;

        tokio::fs::create_dir_all(&config.archive_root)
            .await
            .map_err(|e| {
                ServiceError::InitializationFailed(format!(
                    "cannot create archive root {}: {}",
                    config.archive_root.display(),
                    e
                ))
            })?;

        let store = MetadataStore::open(&config.database_path).await?;
        let credentials: Arc<dyn CredentialProvider> =
            Arc::new(StoredCredentialProvider::new(Arc::clone(&config.secure_store)));

        info!(root = %config.archive_root.display(), "Archive opened");
        Ok(Self::with_store(config, store, credentials))
    }

    /// Assemble a service from an already opened store and a custom
    /// credential provider.
    pub fn with_store(
        config: ArchiveConfig,
        store: MetadataStore,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            coordinator: SyncCoordinator::new(store.clone(), &config.archive_root, &config.sync),
            reconciler: Reconciler::new(store.clone(), &config.archive_root),
            config,
            store,
            credentials,
            run_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    /// Bring the archive up to date with `adapter`.
    #[instrument(skip_all, fields(source = %redact_if_sensitive("source", adapter.source_name())))]
    pub async fn sync_source(
        &self,
        adapter: &dyn SourceAdapter,
        range: &DateRange,
        ctx: &RunContext,
    ) -> Result<RunSummary> {
        let _guard = self.run_lock.lock().await;
        Ok(self.coordinator.sync(adapter, range, ctx).await?)
    }

    /// Refresh the stored labels of `adapter`'s archived messages. Only
    /// messages without labels are looked up unless `all` is set.
    #[instrument(skip_all, fields(source = %redact_if_sensitive("source", adapter.source_name()), all = all))]
    pub async fn update_labels(
        &self,
        adapter: &dyn SourceAdapter,
        all: bool,
        ctx: &RunContext,
    ) -> Result<LabelUpdateReport> {
        let _guard = self.run_lock.lock().await;
        Ok(self.coordinator.update_labels(adapter, all, ctx).await?)
    }

    /// Gmail source for `account` using its stored OAuth credential.
    #[cfg(feature = "gmail")]
    pub async fn gmail_source(&self, account: &str) -> Result<GmailSource> {
        let source_name = GmailSource::source_name_for(account);
        let credential = self.credentials.get_valid(&source_name).await?;
        let access_token = credential
            .access_token()
            .ok_or_else(|| core_auth::AuthError::NotAuthenticated(source_name.clone()))?;
        let http_client = self.config.require_http_client("Gmail source")?;

        Ok(GmailSource::new(
            http_client,
            account,
            access_token,
            &self.config.sync,
        ))
    }

    #[cfg(feature = "gmail")]
    #[instrument(skip(self, account, range, ctx), fields(account = %redact_if_sensitive("account", account)))]
    pub async fn sync_gmail(
        &self,
        account: &str,
        range: &DateRange,
        ctx: &RunContext,
    ) -> Result<RunSummary> {
        let source = self.gmail_source(account).await?.with_stop_signal(ctx.stop_token());
        self.sync_source(&source, range, ctx).await
    }

    #[cfg(feature = "gmail")]
    #[instrument(skip(self, account, ctx), fields(account = %redact_if_sensitive("account", account)))]
    pub async fn update_gmail_labels(
        &self,
        account: &str,
        all: bool,
        ctx: &RunContext,
    ) -> Result<LabelUpdateReport> {
        let source = self.gmail_source(account).await?.with_stop_signal(ctx.stop_token());
        self.update_labels(&source, all, ctx).await
    }

    /// Connected IMAP source for `account` using its stored password
    /// credential.
    #[cfg(feature = "imap")]
    pub async fn imap_source(&self, server: &ImapServer, account: &str) -> Result<ImapSource> {
        let source_name = ImapSource::source_name_for(account);
        let credential = self.credentials.get_valid(&source_name).await?;
        Ok(ImapSource::connect(server, &credential, &self.config.sync).await?)
    }

    #[cfg(feature = "imap")]
    #[instrument(
        skip(self, server, account, range, ctx),
        fields(host = %server.host, account = %redact_if_sensitive("account", account))
    )]
    pub async fn sync_imap(
        &self,
        server: &ImapServer,
        account: &str,
        range: &DateRange,
        ctx: &RunContext,
    ) -> Result<RunSummary> {
        let source = self.imap_source(server, account).await?;
        let summary = self.sync_source(&source, range, ctx).await;
        if let Err(e) = source.logout().await {
            warn!(error = %e, "IMAP logout failed");
        }
        summary
    }

    #[cfg(feature = "imap")]
    #[instrument(
        skip(self, server, account, ctx),
        fields(host = %server.host, account = %redact_if_sensitive("account", account))
    )]
    pub async fn update_imap_labels(
        &self,
        server: &ImapServer,
        account: &str,
        all: bool,
        ctx: &RunContext,
    ) -> Result<LabelUpdateReport> {
        let source = self.imap_source(server, account).await?;
        let report = self.update_labels(&source, all, ctx).await;
        if let Err(e) = source.logout().await {
            warn!(error = %e, "IMAP logout failed");
        }
        report
    }

    pub async fn search(&self, query: &str, options: &SearchOptions) -> Result<Vec<SearchHit>> {
        Ok(self.store.search(query, options).await?)
    }

    /// Check index consistency and, when requested, file integrity.
    /// `options.repair` removes duplicate and orphaned index rows.
    pub async fn verify(&self, options: VerifyOptions) -> Result<VerifyReport> {
        let _guard = self.run_lock.lock().await;
        Ok(self.reconciler.verify(options).await?)
    }

    /// Compare the remote message set of `adapter` with the archive.
    pub async fn sync_check(&self, adapter: &dyn SourceAdapter) -> Result<SyncCheckReport> {
        Ok(self.reconciler.sync_check(adapter).await?)
    }

    pub async fn reindex(&self, force: bool, ctx: &RunContext) -> Result<PipelineReport> {
        let _guard = self.run_lock.lock().await;
        Ok(self.coordinator.reindex(force, ctx).await?)
    }

    pub async fn stats(&self) -> Result<ArchiveStats> {
        Ok(self.store.stats().await?)
    }

    /// Close the metadata store. Pending runs must have finished.
    pub async fn close(&self) {
        let _guard = self.run_lock.lock().await;
        self.store.close().await;
    }
}

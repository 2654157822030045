//! `ArchiveService` over an in-memory store and a scripted source.

use async_trait::async_trait;
use bridge_traits::error::Result as BridgeResult;
use bridge_traits::SecureStore;
use core_archive::{MetadataStore, SearchOptions};
use core_auth::{CredentialProvider, StoredCredentialProvider};
use core_runtime::config::ArchiveConfig;
use core_service::{ArchiveService, ServiceError};
use core_sync::{
    BatchFetch, DateRange, FetchedMessage, IncrementalPlan, Result, RunContext, SourceAdapter,
    SyncCursor, SyncError, VerifyOptions, GMAIL_LABEL_HEADER,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

#[derive(Default)]
struct MemorySecureStore {
    storage: Mutex<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl SecureStore for MemorySecureStore {
    async fn set_secret(&self, key: &str, value: &[u8]) -> BridgeResult<()> {
        self.storage
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get_secret(&self, key: &str) -> BridgeResult<Option<Vec<u8>>> {
        Ok(self.storage.lock().unwrap().get(key).cloned())
    }

    async fn delete_secret(&self, key: &str) -> BridgeResult<()> {
        self.storage.lock().unwrap().remove(key);
        Ok(())
    }
}

/// Fixed mailbox with a change-feed cursor.
struct StaticSource {
    messages: Vec<(String, Vec<u8>)>,
}

impl StaticSource {
    fn new(subjects: &[(&str, &str)]) -> Self {
        Self {
            messages: subjects
                .iter()
                .map(|(id, subject)| {
                    let raw = format!(
                        "From: Alice <alice@example.com>\r\n\
                         To: bob@example.com\r\n\
                         Subject: {subject}\r\n\
                         Date: Tue, 2 Jan 2024 09:30:00 +0000\r\n\
                         Message-ID: <{id}@example.com>\r\n\
                         \r\n\
                         Notes about {subject}\r\n"
                    );
                    (id.to_string(), raw.into_bytes())
                })
                .collect(),
        }
    }

    fn fetch(&self, id: &str) -> Result<FetchedMessage> {
        self.messages
            .iter()
            .find(|(mid, _)| mid == id)
            .map(|(_, raw)| FetchedMessage::new(raw.clone(), vec!["INBOX".to_string()]))
            .ok_or_else(|| SyncError::Source(format!("{} not found", id)))
    }
}

#[async_trait]
impl SourceAdapter for StaticSource {
    fn source_name(&self) -> &str {
        "gmail:alice@example.com"
    }

    fn label_header(&self) -> &'static str {
        GMAIL_LABEL_HEADER
    }

    async fn enumerate_all(&self, _range: &DateRange) -> Result<Vec<String>> {
        Ok(self.messages.iter().map(|(id, _)| id.clone()).collect())
    }

    async fn plan_incremental(&self, _cursor: &SyncCursor) -> Result<IncrementalPlan> {
        Ok(IncrementalPlan {
            candidates: Vec::new(),
            new_cursor: Some(SyncCursor::change_feed("1")),
        })
    }

    async fn fetch_one(&self, id: &str) -> Result<FetchedMessage> {
        self.fetch(id)
    }

    async fn fetch_batch(&self, ids: &[String]) -> Result<BatchFetch> {
        Ok(ids.iter().map(|id| (id.clone(), self.fetch(id))).collect())
    }

    async fn current_cursor(&self) -> Result<SyncCursor> {
        Ok(SyncCursor::change_feed("1"))
    }
}

fn mailbox() -> StaticSource {
    StaticSource::new(&[
        ("m1", "Quarterly report"),
        ("m2", "Lunch plans"),
        ("m3", "Flight itinerary"),
    ])
}

fn config(root: &TempDir) -> ArchiveConfig {
    ArchiveConfig::builder()
        .archive_root(root.path())
        .secure_store(Arc::new(MemorySecureStore::default()))
        .build()
        .unwrap()
}

async fn service(root: &TempDir) -> ArchiveService {
    let config = config(root);
    let credentials: Arc<dyn CredentialProvider> = Arc::new(StoredCredentialProvider::new(
        Arc::clone(&config.secure_store),
    ));
    let store = MetadataStore::in_memory().await.unwrap();
    ArchiveService::with_store(config, store, credentials)
}

#[tokio::test]
async fn test_sync_then_search_and_stats() {
    let root = TempDir::new().unwrap();
    let service = service(&root).await;
    let source = mailbox();

    let summary = service
        .sync_source(&source, &DateRange::default(), &RunContext::new())
        .await
        .unwrap();
    assert_eq!(summary.succeeded, 3);
    assert!(summary.is_complete());
    assert!(summary.cursor_advanced);

    let hits = service
        .search("itinerary", &SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].message_id, "m3");

    let stats = service.stats().await.unwrap();
    assert_eq!(stats.total_messages, 3);
    assert_eq!(stats.indexed_messages, 3);
    assert_eq!(
        stats.per_source,
        vec![("gmail:alice@example.com".to_string(), 3)]
    );
    assert_eq!(stats.labels, vec![("INBOX".to_string(), 3)]);
}

#[tokio::test]
async fn test_concurrent_runs_are_serialized() {
    let root = TempDir::new().unwrap();
    let service = service(&root).await;
    let source = mailbox();
    let range = DateRange::default();
    let first_ctx = RunContext::new();
    let second_ctx = RunContext::new();

    let (first, second) = tokio::join!(
        service.sync_source(&source, &range, &first_ctx),
        service.sync_source(&source, &range, &second_ctx),
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(first.succeeded + second.succeeded, 3);
    assert_eq!(service.store().count(None).await.unwrap(), 3);
}

#[tokio::test]
async fn test_verify_reindex_and_sync_check() {
    let root = TempDir::new().unwrap();
    let service = service(&root).await;
    let source = mailbox();
    service
        .sync_source(&source, &DateRange::default(), &RunContext::new())
        .await
        .unwrap();

    let report = service
        .verify(VerifyOptions {
            repair: false,
            check_files: true,
        })
        .await
        .unwrap();
    assert!(report.index.is_consistent());
    assert!(report.files.unwrap().is_clean());

    let reindexed = service.reindex(true, &RunContext::new()).await.unwrap();
    assert_eq!(reindexed.succeeded.len(), 3);

    let check = service.sync_check(&source).await.unwrap();
    assert!(check.in_sync());
}

#[tokio::test]
async fn test_update_labels_checks_archived_messages() {
    let root = TempDir::new().unwrap();
    let service = service(&root).await;
    let source = mailbox();
    service
        .sync_source(&source, &DateRange::default(), &RunContext::new())
        .await
        .unwrap();

    let unlabeled = service
        .update_labels(&source, false, &RunContext::new())
        .await
        .unwrap();
    assert_eq!(unlabeled.checked, 0);

    let all = service
        .update_labels(&source, true, &RunContext::new())
        .await
        .unwrap();
    assert!(all.is_clean());
    assert_eq!(all.checked, 3);
    assert_eq!(all.unchanged, 3);

    let error = service
        .update_gmail_labels("alice@example.com", true, &RunContext::new())
        .await
        .unwrap_err();
    assert!(matches!(error, ServiceError::Auth(_)));
}

#[tokio::test]
async fn test_gmail_sync_requires_credential() {
    let root = TempDir::new().unwrap();
    let service = service(&root).await;

    let error = service
        .sync_gmail("alice@example.com", &DateRange::default(), &RunContext::new())
        .await
        .unwrap_err();

    assert!(matches!(
        error,
        ServiceError::Auth(core_auth::AuthError::NotAuthenticated(source))
            if source == "gmail:alice@example.com"
    ));
}

#[tokio::test]
async fn test_open_creates_archive_on_disk() {
    let root = TempDir::new().unwrap();
    let archive_root = root.path().join("mail");
    let config = ArchiveConfig::builder()
        .archive_root(&archive_root)
        .secure_store(Arc::new(MemorySecureStore::default()))
        .build()
        .unwrap();

    let service = ArchiveService::open(config).await.unwrap();
    service
        .sync_source(&mailbox(), &DateRange::default(), &RunContext::new())
        .await
        .unwrap();

    assert!(archive_root.join("archive.db").exists());
    assert!(archive_root.join("accounts").is_dir());
    service.close().await;
}

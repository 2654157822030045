//! # Download Pipeline
//!
//! Turns pending identifiers into archived, indexed messages:
//!
//! 1. Fetch raw bytes and labels, one batch at a time
//! 2. Inject labels as a synthetic header
//! 3. Write the file atomically (temp file + rename)
//! 4. Hash the final bytes and upsert the message record
//! 5. Extract fields and upsert the index entry with `indexed_hash`
//! 6. Commit the batch's metadata in one transaction
//!
//! A stop request is honored between items: an item whose fetch has started
//! is still finished. An immediate stop abandons the item in flight; its
//! file write is atomic and its metadata is never staged, so it stays
//! pending for the next run. Whatever was staged before is always committed
//! before the pipeline returns.

use crate::context::{ItemFailure, LabelUpdateReport, PipelineReport, RunContext};
use crate::error::{Result, SyncError};
use crate::extract::{extract_fields, parse_date};
use crate::mailfile::{
    content_hash, inject_labels, path_to_record, relative_message_path, replace_labels, write_atomic,
};
use crate::source::{BatchFetch, FetchedMessage, LabelFetch, SourceAdapter};
use bridge_traits::time::{Clock, SystemClock};
use bridge_traits::RetryPolicy;
use core_archive::{IndexFields, MessageRecord, MetadataStore, StoreBatch};
use core_runtime::config::SyncOptions;
use core_runtime::logging::{redact_if_sensitive, strip_path};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Pipeline tuning.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Items per fetch batch and per metadata commit
    pub batch_size: usize,
    /// Inject labels and store label rows
    pub include_labels: bool,
    /// Whole-batch backoff on rate limiting
    pub retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from(&SyncOptions::default())
    }
}

impl From<&SyncOptions> for PipelineConfig {
    fn from(options: &SyncOptions) -> Self {
        Self {
            batch_size: options.batch_size.max(1),
            include_labels: options.include_labels,
            retry: options.retry_policy(),
        }
    }
}

/// Fetched item ready to be staged in the metadata batch.
struct PreparedItem {
    record: MessageRecord,
    labels: Vec<String>,
    fields: IndexFields,
}

/// Result of processing one item inside a batch.
enum ItemOutcome {
    Done,
    Failed(String),
    Aborted,
}

pub struct Pipeline {
    store: MetadataStore,
    archive_root: PathBuf,
    config: PipelineConfig,
    clock: Arc<dyn Clock>,
}

impl Pipeline {
    pub fn new(store: MetadataStore, archive_root: impl Into<PathBuf>, config: PipelineConfig) -> Self {
        Self {
            store,
            archive_root: archive_root.into(),
            config,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `clock` for `downloaded_at` timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Archive `ids` from `adapter`, in order.
    ///
    /// # Errors
    ///
    /// Only store failures that prevent committing a batch are returned.
    /// Per-item failures are recorded in the report.
    #[instrument(skip_all, fields(source = %redact_if_sensitive("source", adapter.source_name()), items = ids.len()))]
    pub async fn run(
        &self,
        adapter: &dyn SourceAdapter,
        ids: &[String],
        ctx: &RunContext,
    ) -> Result<PipelineReport> {
        let mut report = PipelineReport::default();
        ctx.add_total(ids.len());

        for chunk in ids.chunks(self.config.batch_size) {
            if ctx.should_stop() {
                report.interrupted = true;
                break;
            }

            let fetched = tokio::select! {
                biased;
                _ = ctx.forced() => Err(SyncError::Cancelled),
                result = self.fetch_with_retry(adapter, chunk, ctx) => result,
            };

            let mut fetched = match fetched {
                Ok(fetched) => fetched,
                Err(SyncError::Cancelled) => {
                    report.interrupted = true;
                    break;
                }
                Err(e) => {
                    warn!(error = %e, batch = chunk.len(), "Batch fetch failed");
                    for id in chunk {
                        ctx.record_failure();
                        report.failed.push(ItemFailure::new(id, e.to_string()));
                    }
                    continue;
                }
            };

            let existing: HashMap<String, MessageRecord> = self
                .store
                .records_for(adapter.source_name(), chunk)
                .await?
                .into_iter()
                .map(|r| (r.message_id.clone(), r))
                .collect();

            let mut batch = self.store.begin_batch().await?;
            let mut staged = Vec::new();

            for (position, id) in chunk.iter().enumerate() {
                // The first item was admitted by the check before the fetch.
                if position > 0 && ctx.should_stop() {
                    report.interrupted = true;
                    break;
                }

                let item = fetched
                    .remove(id)
                    .unwrap_or_else(|| Err(SyncError::Source(format!("No data returned for {}", id))));

                match self
                    .process_item(&mut batch, adapter, id, item, existing.get(id), ctx)
                    .await
                {
                    ItemOutcome::Done => staged.push(id.clone()),
                    ItemOutcome::Failed(message) => {
                        warn!(id = %id, error = %message, "Failed to archive message");
                        ctx.record_failure();
                        report.failed.push(ItemFailure::new(id, message));
                    }
                    ItemOutcome::Aborted => {
                        report.interrupted = true;
                        break;
                    }
                }
            }

            batch.commit().await?;
            for id in staged {
                ctx.record_success();
                report.succeeded.push(id);
            }

            if report.interrupted {
                break;
            }
        }

        report.remaining = remaining(ids, &report);

        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            remaining = report.remaining.len(),
            interrupted = report.interrupted,
            "Pipeline finished"
        );
        Ok(report)
    }

    async fn fetch_with_retry(
        &self,
        adapter: &dyn SourceAdapter,
        ids: &[String],
        ctx: &RunContext,
    ) -> Result<BatchFetch> {
        self.with_retry(ctx, || self.fetch(adapter, ids)).await
    }

    /// Run `op` until it succeeds, fails for good or the retry policy runs
    /// out. Backoff sleeps end early on a stop request.
    async fn with_retry<T, F, Fut>(&self, ctx: &RunContext, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && self.config.retry.should_retry(attempt) => {
                    let delay = self.config.retry.delay_for_attempt(attempt);
                    warn!(
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying batch after transient error"
                    );

                    tokio::select! {
                        _ = ctx.stopped() => return Err(SyncError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch(&self, adapter: &dyn SourceAdapter, ids: &[String]) -> Result<BatchFetch> {
        if let [id] = ids {
            return match adapter.fetch_one(id).await {
                Ok(message) => Ok(HashMap::from([(id.clone(), Ok(message))])),
                Err(e) if e.is_retryable() => Err(e),
                Err(e) => Ok(HashMap::from([(id.clone(), Err(e))])),
            };
        }

        adapter.fetch_batch(ids).await
    }

    async fn process_item(
        &self,
        batch: &mut StoreBatch,
        adapter: &dyn SourceAdapter,
        id: &str,
        fetched: Result<FetchedMessage>,
        existing: Option<&MessageRecord>,
        ctx: &RunContext,
    ) -> ItemOutcome {
        let fetched = match fetched {
            Ok(fetched) => fetched,
            Err(e) => return ItemOutcome::Failed(e.to_string()),
        };

        let prepared = tokio::select! {
            biased;
            _ = ctx.forced() => return ItemOutcome::Aborted,
            result = self.persist(adapter, id, fetched, existing) => result,
        };

        let prepared = match prepared {
            Ok(prepared) => prepared,
            Err(e) => return ItemOutcome::Failed(e.to_string()),
        };

        match stage(batch, &prepared).await {
            Ok(()) => ItemOutcome::Done,
            Err(e) => ItemOutcome::Failed(e.to_string()),
        }
    }

    /// Write the message file and derive everything the store needs.
    async fn persist(
        &self,
        adapter: &dyn SourceAdapter,
        id: &str,
        fetched: FetchedMessage,
        existing: Option<&MessageRecord>,
    ) -> Result<PreparedItem> {
        let labels = if self.config.include_labels {
            fetched.labels
        } else {
            Vec::new()
        };
        let bytes = inject_labels(&fetched.raw, adapter.label_header(), &labels);

        let source = adapter.source_name().to_string();
        let message_id = id.to_string();
        let root = self.archive_root.clone();
        // The file location never changes once recorded.
        let existing_path = existing.map(|r| r.relative_path.clone());
        let downloaded_at = existing
            .map(|r| r.downloaded_at)
            .unwrap_or_else(|| self.clock.unix_timestamp());

        let (relative_path, hash, fields) = tokio::task::spawn_blocking(move || {
            let relative = match existing_path {
                Some(path) => PathBuf::from(path),
                None => relative_message_path(&source, &message_id, parse_date(&bytes)),
            };
            write_atomic(&root.join(&relative), &bytes)?;
            Ok::<_, std::io::Error>((path_to_record(&relative), content_hash(&bytes), extract_fields(&bytes)))
        })
        .await
        .map_err(join_error)??;

        debug!(id = %id, file = %strip_path(&relative_path), "Message persisted");

        Ok(PreparedItem {
            record: MessageRecord::new(adapter.source_name(), id, relative_path, downloaded_at, hash),
            labels,
            fields,
        })
    }

    /// Re-extract and re-index `records` from the files on disk.
    ///
    /// Each record's `content_hash` is refreshed from the live file and the
    /// index entry is written with that hash. Missing files are reported as
    /// failures.
    #[instrument(skip_all, fields(records = records.len()))]
    pub async fn reindex(&self, records: &[MessageRecord], ctx: &RunContext) -> Result<PipelineReport> {
        let mut report = PipelineReport::default();
        ctx.add_total(records.len());

        for chunk in records.chunks(self.config.batch_size) {
            if ctx.should_stop() {
                report.interrupted = true;
                break;
            }

            let mut batch = self.store.begin_batch().await?;
            let mut staged = Vec::new();

            for record in chunk {
                if ctx.should_stop() {
                    report.interrupted = true;
                    break;
                }

                let path = self.archive_root.join(&record.relative_path);
                let loaded = tokio::task::spawn_blocking(move || {
                    let bytes = std::fs::read(&path)?;
                    Ok::<_, std::io::Error>((content_hash(&bytes), extract_fields(&bytes)))
                })
                .await
                .map_err(join_error)
                .and_then(|result| result.map_err(SyncError::from));

                let (hash, fields) = match loaded {
                    Ok(loaded) => loaded,
                    Err(e) => {
                        warn!(id = %record.message_id, error = %e, "Cannot reindex message");
                        ctx.record_failure();
                        report
                            .failed
                            .push(ItemFailure::new(&record.message_id, e.to_string()));
                        continue;
                    }
                };

                let mut refreshed = record.clone();
                refreshed.content_hash = Some(hash.clone());

                let staged_ok = async {
                    batch.upsert_message(&refreshed).await?;
                    batch
                        .upsert_index_entry(&record.source, &record.message_id, &fields, &hash)
                        .await
                }
                .await;

                match staged_ok {
                    Ok(()) => staged.push(record.message_id.clone()),
                    Err(e) => {
                        ctx.record_failure();
                        report
                            .failed
                            .push(ItemFailure::new(&record.message_id, e.to_string()));
                    }
                }
            }

            batch.commit().await?;
            for id in staged {
                ctx.record_success();
                report.succeeded.push(id);
            }

            if report.interrupted {
                break;
            }
        }

        let ids: Vec<String> = records.iter().map(|r| r.message_id.clone()).collect();
        report.remaining = remaining(&ids, &report);

        info!(
            indexed = report.succeeded.len(),
            failed = report.failed.len(),
            interrupted = report.interrupted,
            "Reindex finished"
        );
        Ok(report)
    }

    /// Refresh the labels of archived `records` from `adapter`.
    ///
    /// A record whose labels changed gets its file rewritten with the new
    /// label header, a new `content_hash` and new label rows. Its index
    /// entry is left alone, so the record shows up as stale until the next
    /// reindex.
    #[instrument(skip_all, fields(source = %redact_if_sensitive("source", adapter.source_name()), records = records.len()))]
    pub async fn relabel(
        &self,
        adapter: &dyn SourceAdapter,
        records: &[MessageRecord],
        ctx: &RunContext,
    ) -> Result<LabelUpdateReport> {
        let mut report = LabelUpdateReport::default();
        let mut processed = 0;
        ctx.add_total(records.len());

        for chunk in records.chunks(self.config.batch_size) {
            if ctx.should_stop() {
                report.interrupted = true;
                break;
            }

            let ids: Vec<String> = chunk.iter().map(|r| r.message_id.clone()).collect();
            let fetched = tokio::select! {
                biased;
                _ = ctx.forced() => Err(SyncError::Cancelled),
                result = self.with_retry(ctx, || adapter.fetch_labels(&ids)) => result,
            };

            let mut fetched: LabelFetch = match fetched {
                Ok(fetched) => fetched,
                Err(SyncError::Cancelled) => {
                    report.interrupted = true;
                    break;
                }
                Err(e) => {
                    warn!(error = %e, batch = chunk.len(), "Label lookup failed");
                    for id in &ids {
                        ctx.record_failure();
                        report.failed.push(ItemFailure::new(id, e.to_string()));
                    }
                    processed += chunk.len();
                    continue;
                }
            };

            // Read before the batch holds the connection
            let mut stored = HashMap::with_capacity(chunk.len());
            for record in chunk {
                let labels = self.store.labels(&record.source, &record.message_id).await?;
                stored.insert(record.message_id.clone(), labels);
            }

            let mut batch = self.store.begin_batch().await?;
            let mut staged = Vec::new();

            for (position, record) in chunk.iter().enumerate() {
                if position > 0 && ctx.should_stop() {
                    report.interrupted = true;
                    break;
                }

                let id = &record.message_id;
                let labels = match fetched.remove(id) {
                    Some(Ok(labels)) => labels,
                    Some(Err(e)) => {
                        ctx.record_failure();
                        report.failed.push(ItemFailure::new(id, e.to_string()));
                        processed += 1;
                        continue;
                    }
                    None => {
                        ctx.record_success();
                        report.unchanged += 1;
                        processed += 1;
                        continue;
                    }
                };

                if same_labels(&labels, stored.get(id).map(Vec::as_slice).unwrap_or_default()) {
                    ctx.record_success();
                    report.unchanged += 1;
                    processed += 1;
                    continue;
                }

                let rewritten = tokio::select! {
                    biased;
                    _ = ctx.forced() => {
                        report.interrupted = true;
                        break;
                    }
                    result = self.rewrite_labels(adapter.label_header(), record, labels.clone()) => result,
                };

                let outcome = match rewritten {
                    Ok(hash) => {
                        let mut refreshed = record.clone();
                        refreshed.content_hash = Some(hash);
                        async {
                            batch.upsert_message(&refreshed).await?;
                            batch.set_labels(&record.source, id, &labels).await
                        }
                        .await
                        .map_err(SyncError::from)
                    }
                    Err(e) => Err(e),
                };

                processed += 1;
                match outcome {
                    Ok(()) => staged.push(id.clone()),
                    Err(e) => {
                        warn!(id = %id, error = %e, "Cannot update labels");
                        ctx.record_failure();
                        report.failed.push(ItemFailure::new(id, e.to_string()));
                    }
                }
            }

            batch.commit().await?;
            for id in staged {
                ctx.record_success();
                report.updated.push(id);
            }

            if report.interrupted {
                break;
            }
        }

        report.checked = processed;
        report.remaining = records[processed..]
            .iter()
            .map(|r| r.message_id.clone())
            .collect();

        info!(
            updated = report.updated.len(),
            unchanged = report.unchanged,
            failed = report.failed.len(),
            remaining = report.remaining.len(),
            interrupted = report.interrupted,
            "Label update finished"
        );
        Ok(report)
    }

    /// Rewrite the label header of `record`'s file and return the new
    /// content hash.
    async fn rewrite_labels(
        &self,
        header: &'static str,
        record: &MessageRecord,
        labels: Vec<String>,
    ) -> Result<String> {
        let path = self.archive_root.join(&record.relative_path);
        let hash = tokio::task::spawn_blocking(move || {
            let raw = std::fs::read(&path)?;
            let bytes = replace_labels(&raw, header, &labels);
            write_atomic(&path, &bytes)?;
            Ok::<_, std::io::Error>(content_hash(&bytes))
        })
        .await
        .map_err(join_error)??;

        debug!(id = %record.message_id, file = %strip_path(&record.relative_path), "Labels rewritten");
        Ok(hash)
    }
}

async fn stage(batch: &mut StoreBatch, item: &PreparedItem) -> core_archive::Result<()> {
    let record = &item.record;
    let hash = record.content_hash.as_deref().unwrap_or_default();

    batch.upsert_message(record).await?;
    if !item.labels.is_empty() {
        batch
            .set_labels(&record.source, &record.message_id, &item.labels)
            .await?;
    }
    batch
        .upsert_index_entry(&record.source, &record.message_id, &item.fields, hash)
        .await
}

/// Same label set, ignoring order and repeats.
fn same_labels(fetched: &[String], stored: &[String]) -> bool {
    let fetched: HashSet<&str> = fetched.iter().map(String::as_str).collect();
    let stored: HashSet<&str> = stored.iter().map(String::as_str).collect();
    fetched == stored
}

fn join_error(e: tokio::task::JoinError) -> SyncError {
    SyncError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
}

fn remaining(ids: &[String], report: &PipelineReport) -> Vec<String> {
    let attempted: HashSet<&str> = report
        .succeeded
        .iter()
        .map(String::as_str)
        .chain(report.failed.iter().map(|f| f.id.as_str()))
        .collect();

    ids.iter()
        .filter(|id| !attempted.contains(id.as_str()))
        .cloned()
        .collect()
}

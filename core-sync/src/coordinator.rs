//! # Sync Coordinator
//!
//! Drives one sync run for one source.
//!
//! ## Workflow
//!
//! 1. Plan: full or incremental, minus identifiers already archived
//! 2. Run the pipeline over the pending identifiers
//! 3. Advance the cursor if the run completed cleanly
//! 4. Return a [`RunSummary`]
//!
//! ## Usage
//!
//! ```rust,ignore
//! use core_sync::{DateRange, RunContext, SyncCoordinator};
//!
//! let coordinator = SyncCoordinator::new(store, "/srv/mail", &options);
//! let ctx = RunContext::new();
//! let summary = coordinator.sync(&adapter, &DateRange::default(), &ctx).await?;
//! println!("{} archived, {} failed", summary.succeeded, summary.error_count());
//! ```
//!
//! Stop handling belongs to the host: forward interrupt signals to
//! [`RunContext::request_stop`].

use crate::context::{LabelUpdateReport, PipelineReport, RunContext, RunSummary};
use crate::error::Result;
use crate::pipeline::{Pipeline, PipelineConfig};
use crate::planner::SyncPlanner;
use crate::source::{DateRange, SourceAdapter};
use bridge_traits::time::Clock;
use core_archive::MetadataStore;
use core_runtime::config::SyncOptions;
use core_runtime::logging::redact_if_sensitive;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, instrument};

pub struct SyncCoordinator {
    store: MetadataStore,
    planner: SyncPlanner,
    pipeline: Pipeline,
}

impl SyncCoordinator {
    pub fn new(store: MetadataStore, archive_root: impl Into<PathBuf>, options: &SyncOptions) -> Self {
        Self {
            planner: SyncPlanner::new(store.clone()),
            pipeline: Pipeline::new(store.clone(), archive_root, PipelineConfig::from(options)),
            store,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.pipeline = self.pipeline.with_clock(clock);
        self
    }

    /// Bring the archive up to date with `adapter`.
    ///
    /// # Errors
    ///
    /// Planning failures (remote unreachable, store errors) and store
    /// failures while committing. Per-item failures end up in the summary.
    #[instrument(skip(self, adapter, ctx), fields(source = %redact_if_sensitive("source", adapter.source_name())))]
    pub async fn sync(
        &self,
        adapter: &dyn SourceAdapter,
        range: &DateRange,
        ctx: &RunContext,
    ) -> Result<RunSummary> {
        let plan = self.planner.plan(adapter, range).await?;
        let report = self.pipeline.run(adapter, &plan.pending, ctx).await?;
        let cursor_advanced = self.planner.finish(adapter, &plan, &report).await?;

        let summary = RunSummary {
            source: adapter.source_name().to_string(),
            mode: plan.mode.as_str().to_string(),
            candidates: plan.discovered,
            already_archived: plan.already_archived,
            succeeded: report.succeeded.len(),
            failed: report.failed,
            remaining: report.remaining.len(),
            interrupted: report.interrupted,
            cursor_advanced,
        };

        info!(
            mode = %summary.mode,
            candidates = summary.candidates,
            succeeded = summary.succeeded,
            failed = summary.error_count(),
            remaining = summary.remaining,
            interrupted = summary.interrupted,
            cursor_advanced = summary.cursor_advanced,
            "Sync run finished"
        );
        Ok(summary)
    }

    /// Re-index records whose index entry is missing or stale, or every
    /// record when `force` is set.
    #[instrument(skip(self, ctx))]
    pub async fn reindex(&self, force: bool, ctx: &RunContext) -> Result<PipelineReport> {
        let records = self.store.records_needing_index(force).await?;
        info!(records = records.len(), "Reindexing");
        self.pipeline.reindex(&records, ctx).await
    }

    /// Bring stored labels of `adapter`'s archived messages in line with
    /// the source. Only records with no labels yet are looked up unless
    /// `all` is set. Rewritten files are left stale in the index.
    #[instrument(skip(self, adapter, ctx), fields(source = %redact_if_sensitive("source", adapter.source_name())))]
    pub async fn update_labels(
        &self,
        adapter: &dyn SourceAdapter,
        all: bool,
        ctx: &RunContext,
    ) -> Result<LabelUpdateReport> {
        let source = adapter.source_name();
        let records = if all {
            self.store.records(Some(source)).await?
        } else {
            self.store.unlabeled_records(source).await?
        };

        info!(records = records.len(), "Updating labels");
        self.pipeline.relabel(adapter, &records, ctx).await
    }
}

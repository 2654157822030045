//! # Sync Planner
//!
//! Decides how a source is scanned on each run and when its cursor moves.
//!
//! | Situation                   | Scan        | Reason           |
//! |-----------------------------|-------------|------------------|
//! | no stored cursor            | full        | `NoCursor`       |
//! | `since`/`until` requested   | full        | `DateFilter`     |
//! | remote purged the history   | full        | `CursorExpired`  |
//! | cursor unreadable or unused | full        | `CursorUnusable` |
//! | usable cursor               | incremental | `Incremental`    |
//!
//! Whatever the scan, identifiers already in the store are dropped before
//! the pipeline sees them. Cursor accuracy only affects how much is
//! enumerated, never what ends up archived.

use crate::context::PipelineReport;
use crate::error::{Result, SyncError};
use crate::source::{DateRange, SourceAdapter, SyncCursor};
use core_archive::MetadataStore;
use core_runtime::logging::redact_if_sensitive;
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    Full,
    Incremental,
}

impl ScanMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanMode::Full => "full",
            ScanMode::Incremental => "incremental",
        }
    }
}

/// Why a scan mode was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanReason {
    NoCursor,
    DateFilter,
    CursorExpired,
    CursorUnusable,
    Incremental,
}

/// Work for one run of one source.
#[derive(Debug, Clone)]
pub struct SyncPlan {
    pub mode: ScanMode,
    pub reason: PlanReason,
    pub range: DateRange,
    /// Identifiers the source reported
    pub discovered: usize,
    /// Reported identifiers skipped because they are already archived
    pub already_archived: usize,
    /// Identifiers to hand to the pipeline, in source order
    pub pending: Vec<String>,
    /// Cursor to store once the run completes cleanly
    pub new_cursor: Option<SyncCursor>,
}

pub struct SyncPlanner {
    store: MetadataStore,
}

impl SyncPlanner {
    pub fn new(store: MetadataStore) -> Self {
        Self { store }
    }

    /// Build the plan for `adapter`.
    ///
    /// # Errors
    ///
    /// Remote and store failures. A cursor the remote no longer honors is
    /// not an error: the stored cursor is cleared and a full scan is planned.
    #[instrument(skip(self, adapter), fields(source = %redact_if_sensitive("source", adapter.source_name())))]
    pub async fn plan(&self, adapter: &dyn SourceAdapter, range: &DateRange) -> Result<SyncPlan> {
        let source = adapter.source_name();

        if !range.is_unbounded() {
            info!("Date filter requested, running full scan without cursor");
            let candidates = adapter.enumerate_all(range).await?;
            return self
                .build(source, ScanMode::Full, PlanReason::DateFilter, range, candidates, None)
                .await;
        }

        let reason = match self.store.load_cursor(source).await? {
            None => PlanReason::NoCursor,
            Some(raw) => match SyncCursor::from_json(&raw) {
                Err(e) => {
                    warn!(error = %e, "Stored cursor is unreadable");
                    PlanReason::CursorUnusable
                }
                Ok(cursor) => match adapter.plan_incremental(&cursor).await {
                    Ok(plan) => match plan.new_cursor {
                        Some(new_cursor) => {
                            return self
                                .build(
                                    source,
                                    ScanMode::Incremental,
                                    PlanReason::Incremental,
                                    range,
                                    plan.candidates,
                                    Some(new_cursor),
                                )
                                .await;
                        }
                        None => PlanReason::CursorUnusable,
                    },
                    Err(SyncError::CursorExpired { reason, .. }) => {
                        warn!(reason = %reason, "Cursor expired, falling back to full scan");
                        self.store.clear_cursor(source).await?;
                        PlanReason::CursorExpired
                    }
                    Err(e) => return Err(e),
                },
            },
        };

        // Snapshot before enumerating so messages that arrive mid-scan are
        // picked up by the next incremental run.
        let snapshot = adapter.current_cursor().await?;
        let candidates = adapter.enumerate_all(range).await?;
        self.build(source, ScanMode::Full, reason, range, candidates, Some(snapshot))
            .await
    }

    async fn build(
        &self,
        source: &str,
        mode: ScanMode,
        reason: PlanReason,
        range: &DateRange,
        candidates: Vec<String>,
        new_cursor: Option<SyncCursor>,
    ) -> Result<SyncPlan> {
        let discovered = candidates.len();
        let archived = self.store.downloaded_ids(source).await?;

        let mut seen = HashSet::with_capacity(candidates.len());
        let mut already_archived = 0;
        let mut pending = Vec::new();
        for id in candidates {
            if archived.contains(&id) {
                already_archived += 1;
            } else if seen.insert(id.clone()) {
                pending.push(id);
            }
        }

        info!(
            mode = mode.as_str(),
            reason = ?reason,
            discovered = discovered,
            already_archived = already_archived,
            pending = pending.len(),
            "Sync plan ready"
        );

        Ok(SyncPlan {
            mode,
            reason,
            range: *range,
            discovered,
            already_archived,
            pending,
            new_cursor,
        })
    }

    /// Store the plan's cursor if the run finished cleanly.
    ///
    /// The cursor only moves when every pending item was archived, nothing
    /// failed, the run was not interrupted and no date filter applied.
    /// Returns whether the cursor was advanced.
    pub async fn finish(
        &self,
        adapter: &dyn SourceAdapter,
        plan: &SyncPlan,
        report: &PipelineReport,
    ) -> Result<bool> {
        let source = adapter.source_name();

        if !plan.range.is_unbounded() {
            debug!(source = %redact_if_sensitive("source", source), "Date-filtered run, cursor untouched");
            return Ok(false);
        }

        if !report.is_clean() {
            info!(
                source = %redact_if_sensitive("source", source),
                failed = report.failed.len(),
                remaining = report.remaining.len(),
                interrupted = report.interrupted,
                "Run incomplete, cursor not advanced"
            );
            return Ok(false);
        }

        let cursor = match &plan.new_cursor {
            Some(cursor) => cursor.clone(),
            None => adapter.current_cursor().await?,
        };
        self.store.save_cursor(source, &cursor.to_json()?).await?;

        info!(source = %redact_if_sensitive("source", source), "Cursor advanced");
        Ok(true)
    }
}

//! Run context and run summary.
//!
//! The host owns interrupt handling and calls [`RunContext::request_stop`];
//! the pipeline polls the context between items. The first request asks
//! for a graceful stop (finish the current item, commit, exit), the second
//! forces an immediate exit.

use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How the host wants the current run to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopRequest {
    None,
    Graceful,
    Immediate,
}

/// Shared state of one run: stop signal plus live progress counters.
#[derive(Debug, Default)]
pub struct RunContext {
    stop_requests: AtomicU32,
    graceful: CancellationToken,
    forced: CancellationToken,
    total: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one stop signal and return the resulting request level.
    pub fn request_stop(&self) -> StopRequest {
        let previous = self.stop_requests.fetch_add(1, Ordering::SeqCst);
        self.graceful.cancel();
        if previous == 0 {
            info!("Stop requested, finishing current item");
            StopRequest::Graceful
        } else {
            warn!("Second stop requested, aborting immediately");
            self.forced.cancel();
            StopRequest::Immediate
        }
    }

    pub fn stop_request(&self) -> StopRequest {
        if self.forced.is_cancelled() {
            StopRequest::Immediate
        } else if self.graceful.is_cancelled() {
            StopRequest::Graceful
        } else {
            StopRequest::None
        }
    }

    pub fn should_stop(&self) -> bool {
        self.graceful.is_cancelled()
    }

    pub fn is_forced(&self) -> bool {
        self.forced.is_cancelled()
    }

    /// Resolves once an immediate stop has been requested.
    pub async fn forced(&self) {
        self.forced.cancelled().await
    }

    /// Resolves once any stop has been requested.
    pub async fn stopped(&self) {
        self.graceful.cancelled().await
    }

    /// Token cancelled by the first stop request, for sources that wait on
    /// their own (rate-limit backoff). Cancelling it does not stop the run.
    pub fn stop_token(&self) -> CancellationToken {
        self.graceful.child_token()
    }

    pub(crate) fn add_total(&self, count: usize) {
        self.total.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_success(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn progress(&self) -> RunProgress {
        let total = self.total.load(Ordering::Relaxed);
        let succeeded = self.succeeded.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        RunProgress {
            total,
            succeeded,
            failed,
            remaining: total.saturating_sub(succeeded + failed),
        }
    }
}

/// Point-in-time view of the run counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunProgress {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub remaining: usize,
}

/// One identifier that could not be archived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    pub id: String,
    pub message: String,
}

impl ItemFailure {
    pub fn new(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            message: message.into(),
        }
    }
}

/// Outcome of processing a list of identifiers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<ItemFailure>,
    /// Identifiers never attempted because the run stopped
    pub remaining: Vec<String>,
    pub interrupted: bool,
}

impl PipelineReport {
    pub fn is_clean(&self) -> bool {
        !self.interrupted && self.failed.is_empty() && self.remaining.is_empty()
    }
}

/// Outcome of refreshing the labels of archived messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LabelUpdateReport {
    pub checked: usize,
    /// Records whose labels changed; their files were rewritten
    pub updated: Vec<String>,
    /// Records whose labels already matched or are not known at the source
    pub unchanged: usize,
    pub failed: Vec<ItemFailure>,
    /// Records never looked at because the run stopped
    pub remaining: Vec<String>,
    pub interrupted: bool,
}

impl LabelUpdateReport {
    pub fn is_clean(&self) -> bool {
        !self.interrupted && self.failed.is_empty() && self.remaining.is_empty()
    }
}

/// What a sync run did, as reported to the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub source: String,
    /// `full` or `incremental`
    pub mode: String,
    /// Identifiers the source reported
    pub candidates: usize,
    /// Candidates skipped because they were already archived
    pub already_archived: usize,
    pub succeeded: usize,
    pub failed: Vec<ItemFailure>,
    pub remaining: usize,
    pub interrupted: bool,
    pub cursor_advanced: bool,
}

impl RunSummary {
    pub fn error_count(&self) -> usize {
        self.failed.len()
    }

    /// A run is complete when nothing is left to do and nothing failed.
    pub fn is_complete(&self) -> bool {
        !self.interrupted && self.failed.is_empty() && self.remaining == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_escalation() {
        let ctx = RunContext::new();
        assert_eq!(ctx.stop_request(), StopRequest::None);
        assert!(!ctx.should_stop());

        assert_eq!(ctx.request_stop(), StopRequest::Graceful);
        assert!(ctx.should_stop());
        assert!(!ctx.is_forced());

        assert_eq!(ctx.request_stop(), StopRequest::Immediate);
        assert!(ctx.is_forced());
        assert_eq!(ctx.stop_request(), StopRequest::Immediate);
    }

    #[tokio::test]
    async fn test_forced_future_resolves() {
        let ctx = std::sync::Arc::new(RunContext::new());
        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.forced().await })
        };

        ctx.request_stop();
        ctx.request_stop();

        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("forced() should resolve")
            .unwrap();
    }

    #[test]
    fn test_progress_counters() {
        let ctx = RunContext::new();
        ctx.add_total(5);
        ctx.record_success();
        ctx.record_success();
        ctx.record_failure();

        assert_eq!(
            ctx.progress(),
            RunProgress {
                total: 5,
                succeeded: 2,
                failed: 1,
                remaining: 2,
            }
        );
    }

    #[test]
    fn test_summary_completeness() {
        let mut summary = RunSummary::default();
        assert!(summary.is_complete());

        summary.failed.push(ItemFailure::new("1", "boom"));
        assert!(!summary.is_complete());
        assert_eq!(summary.error_count(), 1);
    }
}

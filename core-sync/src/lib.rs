//! # Sync & Integrity Module
//!
//! Mirrors a remote mailbox into the local archive and keeps the archive
//! consistent with itself.
//!
//! ## Overview
//!
//! - Listing pending messages through a `SourceAdapter`
//! - Collapsing cross-folder copies to one archived message
//! - Fetching, persisting and indexing messages in batches
//! - Advancing the per-source cursor only after clean runs
//! - Detecting drift between files, records, index and remote
//!
//! ## Components
//!
//! - **Source Adapter** (`source`): contract implemented by each provider, plus `SyncCursor`
//! - **Deduplicator** (`dedup`): canonical location and labels for folder-scan sources
//! - **Sync Planner** (`planner`): full vs. incremental, cursor gate
//! - **Pipeline** (`pipeline`): fetch → persist → hash → index → commit
//! - **Run Context** (`context`): stop requests, live counters, run summary
//! - **Reconciler** (`reconciler`): verify, repair, integrity and sync checks
//! - **Sync Coordinator** (`coordinator`): one run for one source
//! - **Message files** (`mailfile`, `extract`): layout, label header, hashing, field extraction

pub mod context;
pub mod coordinator;
pub mod dedup;
pub mod error;
pub mod extract;
pub mod mailfile;
pub mod pipeline;
pub mod planner;
pub mod reconciler;
pub mod source;

pub use context::{
    ItemFailure, LabelUpdateReport, PipelineReport, RunContext, RunProgress, RunSummary,
    StopRequest,
};
pub use coordinator::SyncCoordinator;
pub use dedup::{DedupOutcome, DedupStrategy, Deduplicator, FolderScan, ScannedMessage};
pub use error::{Result, SyncError};
pub use extract::{extract_fields, message_identity, parse_date};
pub use mailfile::{
    content_hash, inject_labels, replace_labels, FOLDER_LABEL_HEADER, GMAIL_LABEL_HEADER,
};
pub use pipeline::{Pipeline, PipelineConfig};
pub use planner::{PlanReason, ScanMode, SyncPlan, SyncPlanner};
pub use reconciler::{
    DirFinding, FileFinding, FileStatus, IndexReport, IntegrityReport, Reconciler, SyncCheckReport,
    VerifyOptions, VerifyReport,
};
pub use source::{
    BatchFetch, DateRange, FetchedMessage, FolderCursor, IncrementalPlan, LabelFetch,
    SourceAdapter, SyncCursor,
};

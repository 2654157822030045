//! # Reconciler
//!
//! Compares the filesystem, the metadata store, the search index and
//! optionally the remote source, and reports where they disagree.
//!
//! Nothing is modified unless repair is requested, and even then only the
//! mechanical index fixes are applied:
//!
//! - duplicate index rows: keep the most recently written row
//! - orphaned index rows: delete
//!
//! Missing and stale index entries need a reindex pass. Missing or corrupted
//! files need a fresh download. Both are reported only.

use crate::error::Result;
use crate::mailfile::hash_file;
use crate::source::{DateRange, SourceAdapter};
use core_archive::{DuplicateIndexGroup, MessageKey, MessageRecord, MetadataStore};
use core_runtime::logging::{redact_if_sensitive, strip_path};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

const ACCOUNTS_DIR: &str = "accounts";
const MESSAGE_EXTENSION: &str = "eml";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyOptions {
    /// Apply the mechanical index repairs
    pub repair: bool,
    /// Hash every archived file against its record
    pub check_files: bool,
}

/// Index-side consistency findings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexReport {
    pub records: i64,
    pub index_rows: i64,
    pub duplicates: Vec<DuplicateIndexGroup>,
    pub orphans: Vec<MessageKey>,
    pub missing: Vec<MessageKey>,
    pub stale: Vec<MessageKey>,
    /// Records with neither hash but with an index row. Needs an operator.
    pub anomalies: Vec<MessageKey>,
    pub removed_duplicates: u64,
    pub removed_orphans: u64,
}

impl IndexReport {
    pub fn is_consistent(&self) -> bool {
        self.duplicates.is_empty()
            && self.orphans.is_empty()
            && self.missing.is_empty()
            && self.stale.is_empty()
            && self.anomalies.is_empty()
    }

    /// Findings a repair pass cannot fix.
    pub fn needs_reindex(&self) -> bool {
        !self.missing.is_empty() || !self.stale.is_empty()
    }
}

/// State of one archived file relative to its record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileStatus {
    Ok,
    Missing,
    Corrupted { expected: String, actual: String },
    NoHash,
    /// Present but could not be read
    Unreadable { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileFinding {
    pub key: MessageKey,
    pub relative_path: String,
    pub status: FileStatus,
}

/// File-side consistency findings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub checked: usize,
    pub ok: usize,
    /// Every non-OK file
    pub problems: Vec<FileFinding>,
    /// `.eml` files under the archive with no record, archive-relative
    pub orphaned_files: Vec<String>,
    /// Directories under the archive that could not be listed
    pub unreadable_dirs: Vec<DirFinding>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirFinding {
    pub relative_path: String,
    pub reason: String,
}

impl IntegrityReport {
    pub fn count(&self, wanted: fn(&FileStatus) -> bool) -> usize {
        self.problems.iter().filter(|f| wanted(&f.status)).count()
    }

    pub fn is_clean(&self) -> bool {
        self.problems.is_empty() && self.orphaned_files.is_empty() && self.unreadable_dirs.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub index: IndexReport,
    pub files: Option<IntegrityReport>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.index.is_consistent() && self.files.as_ref().map_or(true, IntegrityReport::is_clean)
    }
}

/// Remote identifier set against the local one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncCheckReport {
    pub source: String,
    pub remote_total: usize,
    pub local_total: usize,
    /// On the remote, not yet archived
    pub remote_only: Vec<String>,
    /// Archived, no longer on the remote
    pub local_only: Vec<String>,
}

impl SyncCheckReport {
    pub fn in_sync(&self) -> bool {
        self.remote_only.is_empty() && self.local_only.is_empty()
    }
}

pub struct Reconciler {
    store: MetadataStore,
    archive_root: PathBuf,
}

impl Reconciler {
    pub fn new(store: MetadataStore, archive_root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            archive_root: archive_root.into(),
        }
    }

    #[instrument(skip(self))]
    pub async fn verify(&self, options: VerifyOptions) -> Result<VerifyReport> {
        let index = self.check_index(options.repair).await?;
        let files = if options.check_files {
            Some(self.check_files().await?)
        } else {
            None
        };

        Ok(VerifyReport { index, files })
    }

    /// Diff the metadata store against the search index.
    pub async fn check_index(&self, repair: bool) -> Result<IndexReport> {
        let mut report = IndexReport {
            records: self.store.count(None).await?,
            duplicates: self.store.index_duplicates().await?,
            orphans: self.store.index_orphans().await?,
            missing: self.store.missing_index_entries().await?,
            stale: self
                .store
                .stale_records()
                .await?
                .iter()
                .map(MessageRecord::key)
                .collect(),
            anomalies: self.store.unhashed_index_entries().await?,
            ..IndexReport::default()
        };

        if repair {
            if !report.duplicates.is_empty() {
                report.removed_duplicates = self.store.remove_duplicate_index_rows().await?;
            }
            if !report.orphans.is_empty() {
                report.removed_orphans = self.store.remove_index_orphans().await?;
            }
        }
        report.index_rows = self.store.index_row_count().await?;

        for key in &report.anomalies {
            warn!(
                source = %redact_if_sensitive("source", &key.source),
                message_id = %key.message_id,
                "Index row exists for a record with no hashes"
            );
        }

        info!(
            records = report.records,
            index_rows = report.index_rows,
            duplicates = report.duplicates.len(),
            orphans = report.orphans.len(),
            missing = report.missing.len(),
            stale = report.stale.len(),
            anomalies = report.anomalies.len(),
            "Index check finished"
        );
        Ok(report)
    }

    /// Hash every archived file and look for files nobody references.
    pub async fn check_files(&self) -> Result<IntegrityReport> {
        let records = self.store.records(None).await?;
        let root = self.archive_root.clone();

        let report = tokio::task::spawn_blocking(move || check_files_blocking(&root, &records))
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

        info!(
            checked = report.checked,
            ok = report.ok,
            problems = report.problems.len(),
            orphaned_files = report.orphaned_files.len(),
            unreadable_dirs = report.unreadable_dirs.len(),
            "File check finished"
        );
        Ok(report)
    }

    /// Compare a full remote enumeration with the archived identifiers.
    /// Never modifies anything.
    #[instrument(skip(self, adapter), fields(source = %redact_if_sensitive("source", adapter.source_name())))]
    pub async fn sync_check(&self, adapter: &dyn SourceAdapter) -> Result<SyncCheckReport> {
        let source = adapter.source_name();
        let remote = adapter.enumerate_all(&DateRange::default()).await?;
        let local = self.store.downloaded_ids(source).await?;

        let remote_set: HashSet<&str> = remote.iter().map(String::as_str).collect();

        let mut seen = HashSet::new();
        let remote_only: Vec<String> = remote
            .iter()
            .filter(|id| !local.contains(id.as_str()) && seen.insert(id.as_str()))
            .cloned()
            .collect();

        let mut local_only: Vec<String> = local
            .iter()
            .filter(|id| !remote_set.contains(id.as_str()))
            .cloned()
            .collect();
        local_only.sort();

        let report = SyncCheckReport {
            source: source.to_string(),
            remote_total: remote_set.len(),
            local_total: local.len(),
            remote_only,
            local_only,
        };

        info!(
            remote = report.remote_total,
            local = report.local_total,
            remote_only = report.remote_only.len(),
            local_only = report.local_only.len(),
            "Sync check finished"
        );
        Ok(report)
    }
}

fn check_files_blocking(root: &Path, records: &[MessageRecord]) -> IntegrityReport {
    let mut report = IntegrityReport {
        checked: records.len(),
        ..IntegrityReport::default()
    };

    let mut known = HashSet::with_capacity(records.len());
    for record in records {
        known.insert(record.relative_path.clone());

        let status = file_status(&root.join(&record.relative_path), record.content_hash.as_deref());
        match status {
            FileStatus::Ok => report.ok += 1,
            status => {
                if let FileStatus::Unreadable { reason } = &status {
                    warn!(
                        file = %strip_path(&record.relative_path),
                        error = %reason,
                        "Cannot read archived file"
                    );
                }
                report.problems.push(FileFinding {
                    key: record.key(),
                    relative_path: record.relative_path.clone(),
                    status,
                });
            }
        }
    }

    let mut files = Vec::new();
    collect_message_files(root, &root.join(ACCOUNTS_DIR), &mut files, &mut report.unreadable_dirs);
    files.retain(|path| !known.contains(path));
    files.sort();
    report.orphaned_files = files;

    report
}

fn file_status(path: &Path, expected: Option<&str>) -> FileStatus {
    match std::fs::metadata(path) {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return FileStatus::Missing,
        Err(e) => {
            return FileStatus::Unreadable {
                reason: e.to_string(),
            }
        }
    }

    let Some(expected) = expected else {
        return FileStatus::NoHash;
    };

    match hash_file(path) {
        Ok(actual) if actual == expected => FileStatus::Ok,
        Ok(actual) => FileStatus::Corrupted {
            expected: expected.to_string(),
            actual,
        },
        Err(e) => FileStatus::Unreadable {
            reason: e.to_string(),
        },
    }
}

/// Collect archive-relative `.eml` paths under `dir`. A directory that
/// cannot be listed is recorded in `unreadable` and the walk goes on.
fn collect_message_files(root: &Path, dir: &Path, out: &mut Vec<String>, unreadable: &mut Vec<DirFinding>) {
    if !dir.is_dir() {
        return;
    }

    let relative = |path: &Path| {
        path.strip_prefix(root)
            .map(crate::mailfile::path_to_record)
            .unwrap_or_else(|_| path.to_string_lossy().into_owned())
    };

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %strip_path(&relative(dir)), error = %e, "Cannot list archive directory");
            unreadable.push(DirFinding {
                relative_path: relative(dir),
                reason: e.to_string(),
            });
            return;
        }
    };

    for entry in entries {
        let path = match entry {
            Ok(entry) => entry.path(),
            Err(e) => {
                unreadable.push(DirFinding {
                    relative_path: relative(dir),
                    reason: e.to_string(),
                });
                continue;
            }
        };
        if path.is_dir() {
            collect_message_files(root, &path, out, unreadable);
        } else if path.extension().and_then(|e| e.to_str()) == Some(MESSAGE_EXTENSION) {
            if let Ok(relative) = path.strip_prefix(root) {
                out.push(crate::mailfile::path_to_record(relative));
            }
        }
    }
}

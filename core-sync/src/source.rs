//! # Source Adapters
//!
//! One contract over two remote change-tracking models:
//!
//! - **Change feed**: a single monotonic cursor for the whole mailbox
//!   (Gmail history ids). Labels come from a side lookup.
//! - **Folder scan**: per-folder UID sequences guarded by a validity epoch
//!   (IMAP UIDVALIDITY). Identity and labels are derived by scanning folders.
//!
//! Both produce plain identifier lists for the planner and raw message
//! bytes for the pipeline.

use crate::error::{Result, SyncError};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Position of one folder in a folder-scan cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderCursor {
    /// Highest UID seen in the folder
    pub max_uid: u32,
    /// UIDVALIDITY the UIDs belong to
    pub uid_validity: u32,
}

/// Saved position of a source, persisted between runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncCursor {
    ChangeFeed { history_id: String },
    FolderScan { folders: BTreeMap<String, FolderCursor> },
}

impl SyncCursor {
    pub fn change_feed(history_id: impl Into<String>) -> Self {
        SyncCursor::ChangeFeed {
            history_id: history_id.into(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| SyncError::InvalidCursor(e.to_string()))
    }

    pub fn from_json(value: &str) -> Result<Self> {
        serde_json::from_str(value).map_err(|e| SyncError::InvalidCursor(e.to_string()))
    }
}

/// Optional date bounds for a full enumeration. `since` is inclusive,
/// `until` exclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateRange {
    pub since: Option<NaiveDate>,
    pub until: Option<NaiveDate>,
}

impl DateRange {
    pub fn new(since: Option<NaiveDate>, until: Option<NaiveDate>) -> Self {
        Self { since, until }
    }

    pub fn is_unbounded(&self) -> bool {
        self.since.is_none() && self.until.is_none()
    }
}

/// Raw message plus the labels it carries at the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMessage {
    pub raw: Vec<u8>,
    pub labels: Vec<String>,
}

impl FetchedMessage {
    pub fn new(raw: impl Into<Vec<u8>>, labels: Vec<String>) -> Self {
        Self {
            raw: raw.into(),
            labels,
        }
    }
}

/// Per-identifier outcome of a batch fetch. An identifier missing from the
/// map failed without a specific reason.
pub type BatchFetch = HashMap<String, Result<FetchedMessage>>;

/// Per-identifier labels from [`SourceAdapter::fetch_labels`]. An identifier
/// missing from the map has no known labels and keeps what is stored.
pub type LabelFetch = HashMap<String, Result<Vec<String>>>;

/// Result of incremental planning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncrementalPlan {
    /// Messages added since the cursor, in processing order
    pub candidates: Vec<String>,
    /// Cursor to persist once every candidate is archived. `None` means
    /// incremental planning did not apply and the caller must fall back to
    /// a full enumeration.
    pub new_cursor: Option<SyncCursor>,
}

/// Remote mailbox seen through the archive's eyes.
///
/// # Errors
///
/// Transient conditions are reported as [`SyncError::RateLimited`] or
/// [`SyncError::Transient`] so the pipeline can back off and retry the
/// whole batch. A cursor the remote no longer honors is reported as
/// [`SyncError::CursorExpired`].
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Stable name of the source (e.g. `gmail:alice@example.com`).
    fn source_name(&self) -> &str;

    /// Header used when injecting labels into persisted messages.
    fn label_header(&self) -> &'static str;

    /// Every message identifier at the source, optionally date-bounded.
    async fn enumerate_all(&self, range: &DateRange) -> Result<Vec<String>>;

    /// Messages added since `cursor`.
    async fn plan_incremental(&self, cursor: &SyncCursor) -> Result<IncrementalPlan>;

    async fn fetch_one(&self, id: &str) -> Result<FetchedMessage>;

    /// Fetch several messages with as few round trips as possible. One
    /// failing item never fails the whole call; an `Err` return means the
    /// batch as a whole could not be attempted.
    async fn fetch_batch(&self, ids: &[String]) -> Result<BatchFetch>;

    /// Snapshot of "caught up to here".
    async fn current_cursor(&self) -> Result<SyncCursor>;

    /// Current labels of already archived messages.
    ///
    /// The default fetches the full messages and keeps their labels.
    /// Sources with a cheaper lookup override it.
    async fn fetch_labels(&self, ids: &[String]) -> Result<LabelFetch> {
        let fetched = self.fetch_batch(ids).await?;
        Ok(fetched
            .into_iter()
            .map(|(id, outcome)| (id, outcome.map(|message| message.labels)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_json_shapes() {
        let feed = SyncCursor::change_feed("12345");
        assert_eq!(
            feed.to_json().unwrap(),
            r#"{"kind":"change_feed","history_id":"12345"}"#
        );

        let mut folders = BTreeMap::new();
        folders.insert(
            "INBOX".to_string(),
            FolderCursor {
                max_uid: 42,
                uid_validity: 7,
            },
        );
        let scan = SyncCursor::FolderScan { folders };
        let json = scan.to_json().unwrap();
        assert_eq!(
            json,
            r#"{"kind":"folder_scan","folders":{"INBOX":{"max_uid":42,"uid_validity":7}}}"#
        );
        assert_eq!(SyncCursor::from_json(&json).unwrap(), scan);
    }

    #[test]
    fn test_invalid_cursor_json() {
        assert!(matches!(
            SyncCursor::from_json("12345"),
            Err(SyncError::InvalidCursor(_))
        ));
    }

    #[test]
    fn test_date_range() {
        assert!(DateRange::default().is_unbounded());
        let range = DateRange::new(NaiveDate::from_ymd_opt(2024, 1, 1), None);
        assert!(!range.is_unbounded());
    }
}

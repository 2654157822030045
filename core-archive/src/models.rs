//! Archive data models.

use serde::{Deserialize, Serialize};

/// Durable record of one archived message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct MessageRecord {
    /// Source the message was archived from (e.g. `gmail:alice@example.com`)
    pub source: String,
    /// Source-native identifier, unique within `source`
    pub message_id: String,
    /// Location of the raw message under the archive root, fixed at first download
    pub relative_path: String,
    /// Unix timestamp (seconds) of the first successful persist
    pub downloaded_at: i64,
    /// SHA-256 of the bytes currently on disk
    pub content_hash: Option<String>,
    /// SHA-256 of the bytes last fed into the search index
    pub indexed_hash: Option<String>,
    /// RFC 3339 date taken from the message's `Date` header
    pub email_date: Option<String>,
    pub subject: Option<String>,
    pub sender: Option<String>,
    pub has_attachments: bool,
}

impl MessageRecord {
    /// Record for a freshly persisted message, not yet indexed.
    pub fn new(
        source: impl Into<String>,
        message_id: impl Into<String>,
        relative_path: impl Into<String>,
        downloaded_at: i64,
        content_hash: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            message_id: message_id.into(),
            relative_path: relative_path.into(),
            downloaded_at,
            content_hash: Some(content_hash.into()),
            indexed_hash: None,
            email_date: None,
            subject: None,
            sender: None,
            has_attachments: false,
        }
    }

    pub fn key(&self) -> MessageKey {
        MessageKey {
            source: self.source.clone(),
            message_id: self.message_id.clone(),
        }
    }

    /// Where this record stands relative to the search index.
    pub fn index_state(&self) -> IndexState {
        match (&self.content_hash, &self.indexed_hash) {
            (Some(content), Some(indexed)) if content == indexed => IndexState::Current,
            (Some(_), Some(_)) => IndexState::Stale,
            _ => IndexState::NotIndexed,
        }
    }
}

/// Relationship between `content_hash` and `indexed_hash`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    /// Either hash is absent
    NotIndexed,
    /// The index reflects the file on disk
    Current,
    /// The file changed after the last index pass
    Stale,
}

/// Natural key of a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::FromRow)]
pub struct MessageKey {
    pub source: String,
    pub message_id: String,
}

impl MessageKey {
    pub fn new(source: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            message_id: message_id.into(),
        }
    }
}

/// Textual fields written into the search index for one message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexFields {
    pub subject: String,
    pub sender: String,
    pub recipients: String,
    /// RFC 3339, absent when the message has no parseable `Date` header
    pub date: Option<String>,
    pub body: String,
    pub attachments: Vec<String>,
}

impl IndexFields {
    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }
}

/// Identifier with more than one live index row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DuplicateIndexGroup {
    pub source: String,
    pub message_id: String,
    pub row_count: i64,
}

/// Search result ordering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// FTS rank; falls back to newest first for filter-only queries
    #[default]
    Relevance,
    DateDesc,
    DateAsc,
}

/// Paging, ordering and scoping for a search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchOptions {
    pub limit: i64,
    pub offset: i64,
    pub sort: SortOrder,
    /// Restrict results to one source
    pub source: Option<String>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
            sort: SortOrder::Relevance,
            source: None,
        }
    }
}

impl SearchOptions {
    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_sort(mut self, sort: SortOrder) -> Self {
        self.sort = sort;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// One search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SearchHit {
    pub source: String,
    pub message_id: String,
    pub relative_path: String,
    pub subject: Option<String>,
    pub sender: Option<String>,
    pub email_date: Option<String>,
    /// Matching excerpt with `[` `]` around hits; absent for filter-only queries
    pub snippet: Option<String>,
    /// FTS rank, lower is more relevant; absent for filter-only queries
    pub rank: Option<f64>,
}

/// Aggregate archive statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveStats {
    pub total_messages: i64,
    pub indexed_messages: i64,
    pub oldest_download: Option<i64>,
    pub newest_download: Option<i64>,
    /// `(source, message count)`, sorted by source
    pub per_source: Vec<(String, i64)>,
    /// `(label, message count)`, most used first
    pub labels: Vec<(String, i64)>,
}

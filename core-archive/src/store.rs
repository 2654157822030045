//! Metadata store.
//!
//! One SQLite database holds the archived-message records, their labels,
//! per-source sync state, and the FTS5 search index. Writes made during a
//! sync go through a [`StoreBatch`], which commits many messages in one
//! transaction.

use crate::db::{open_memory_pool, open_pool, PoolSettings};
use crate::error::{ArchiveError, Result};
use crate::models::{
    ArchiveStats, DuplicateIndexGroup, IndexFields, MessageKey, MessageRecord, SearchHit,
    SearchOptions, SortOrder,
};
use crate::query::{parse_query, SqlFilter};
use core_runtime::logging::redact_if_sensitive;
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, instrument, warn};

/// `sync_state` key under which a source's cursor is persisted.
pub const CURSOR_KEY: &str = "cursor";

const INDEX_KEYS: &str = "SELECT DISTINCT source, message_id FROM message_index";

/// Durable record of archived messages, sync cursors and the search index.
#[derive(Clone)]
pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    /// Open (creating if needed) the store at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let pool = open_pool(&PoolSettings::file(path)).await?;
        Ok(Self { pool })
    }

    /// Single-connection in-memory store.
    pub async fn in_memory() -> Result<Self> {
        Ok(Self {
            pool: open_memory_pool().await?,
        })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ========================================================================
    // Message records
    // ========================================================================

    /// Identifiers already archived for `source`.
    pub async fn downloaded_ids(&self, source: &str) -> Result<HashSet<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT message_id FROM messages WHERE source = ?")
            .bind(source)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn get(&self, source: &str, message_id: &str) -> Result<Option<MessageRecord>> {
        let record = sqlx::query_as::<_, MessageRecord>(
            "SELECT * FROM messages WHERE source = ? AND message_id = ?",
        )
        .bind(source)
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// All records, optionally limited to one source, in key order.
    pub async fn records(&self, source: Option<&str>) -> Result<Vec<MessageRecord>> {
        let records = match source {
            Some(source) => {
                sqlx::query_as::<_, MessageRecord>(
                    "SELECT * FROM messages WHERE source = ? ORDER BY message_id",
                )
                .bind(source)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, MessageRecord>(
                    "SELECT * FROM messages ORDER BY source, message_id",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(records)
    }

    /// Records of `source` with no label rows.
    pub async fn unlabeled_records(&self, source: &str) -> Result<Vec<MessageRecord>> {
        let records = sqlx::query_as::<_, MessageRecord>(
            r#"
            SELECT m.* FROM messages m
            WHERE m.source = ?
              AND NOT EXISTS (
                  SELECT 1 FROM message_labels l
                  WHERE l.source = m.source AND l.message_id = m.message_id
              )
            ORDER BY m.message_id
            "#,
        )
        .bind(source)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Existing records among `message_ids` of `source`.
    pub async fn records_for(&self, source: &str, message_ids: &[String]) -> Result<Vec<MessageRecord>> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; message_ids.len()].join(", ");
        let sql = format!(
            "SELECT * FROM messages WHERE source = ? AND message_id IN ({}) ORDER BY message_id",
            placeholders
        );

        let mut query = sqlx::query_as::<_, MessageRecord>(&sql).bind(source);
        for id in message_ids {
            query = query.bind(id);
        }

        Ok(query.fetch_all(&self.pool).await?)
    }

    pub async fn count(&self, source: Option<&str>) -> Result<i64> {
        let (count,): (i64,) = match source {
            Some(source) => {
                sqlx::query_as("SELECT COUNT(*) FROM messages WHERE source = ?")
                    .bind(source)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_as("SELECT COUNT(*) FROM messages")
                    .fetch_one(&self.pool)
                    .await?
            }
        };

        Ok(count)
    }

    pub async fn labels(&self, source: &str, message_id: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT label FROM message_labels WHERE source = ? AND message_id = ? ORDER BY label",
        )
        .bind(source)
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(label,)| label).collect())
    }

    /// Start a write transaction for a batch of pipeline items.
    pub async fn begin_batch(&self) -> Result<StoreBatch> {
        Ok(StoreBatch {
            tx: self.pool.begin().await?,
            operations: 0,
        })
    }

    // ========================================================================
    // Sync state
    // ========================================================================

    pub async fn get_state(&self, source: &str, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM sync_state WHERE source = ? AND key = ?")
                .bind(source)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(value,)| value))
    }

    pub async fn set_state(&self, source: &str, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_state (source, key, value, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(source, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(source)
        .bind(key)
        .bind(value)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn delete_state(&self, source: &str, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM sync_state WHERE source = ? AND key = ?")
            .bind(source)
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Serialized cursor for `source`, if one was saved.
    pub async fn load_cursor(&self, source: &str) -> Result<Option<String>> {
        self.get_state(source, CURSOR_KEY).await
    }

    pub async fn save_cursor(&self, source: &str, cursor: &str) -> Result<()> {
        debug!(source = %redact_if_sensitive("source", source), "Saving sync cursor");
        self.set_state(source, CURSOR_KEY, cursor).await
    }

    pub async fn clear_cursor(&self, source: &str) -> Result<()> {
        info!(source = %redact_if_sensitive("source", source), "Clearing sync cursor");
        self.delete_state(source, CURSOR_KEY).await
    }

    // ========================================================================
    // Index consistency
    // ========================================================================

    /// Identifiers with more than one index row.
    pub async fn index_duplicates(&self) -> Result<Vec<DuplicateIndexGroup>> {
        let groups = sqlx::query_as::<_, DuplicateIndexGroup>(
            r#"
            SELECT source, message_id, COUNT(*) AS row_count
            FROM message_index
            GROUP BY source, message_id
            HAVING COUNT(*) > 1
            ORDER BY source, message_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(groups)
    }

    /// Delete all but the most recently written index row per identifier.
    #[instrument(skip(self))]
    pub async fn remove_duplicate_index_rows(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM message_index
            WHERE rowid NOT IN (
                SELECT MAX(rowid) FROM message_index GROUP BY source, message_id
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!(removed = result.rows_affected(), "Removed duplicate index rows");
        Ok(result.rows_affected())
    }

    /// Index entries whose identifier has no message record.
    pub async fn index_orphans(&self) -> Result<Vec<MessageKey>> {
        let keys = sqlx::query_as::<_, MessageKey>(
            r#"
            SELECT DISTINCT f.source AS source, f.message_id AS message_id
            FROM message_index f
            LEFT JOIN messages m ON m.source = f.source AND m.message_id = f.message_id
            WHERE m.message_id IS NULL
            ORDER BY f.source, f.message_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(keys)
    }

    #[instrument(skip(self))]
    pub async fn remove_index_orphans(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM message_index
            WHERE rowid IN (
                SELECT f.rowid
                FROM message_index f
                LEFT JOIN messages m ON m.source = f.source AND m.message_id = f.message_id
                WHERE m.message_id IS NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!(removed = result.rows_affected(), "Removed orphaned index rows");
        Ok(result.rows_affected())
    }

    /// Records without any index row.
    pub async fn missing_index_entries(&self) -> Result<Vec<MessageKey>> {
        let keys = sqlx::query_as::<_, MessageKey>(&format!(
            r#"
            SELECT m.source AS source, m.message_id AS message_id
            FROM messages m
            LEFT JOIN ({}) f ON f.source = m.source AND f.message_id = m.message_id
            WHERE f.message_id IS NULL
            ORDER BY m.source, m.message_id
            "#,
            INDEX_KEYS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(keys)
    }

    /// Records whose file changed after the last index pass.
    pub async fn stale_records(&self) -> Result<Vec<MessageRecord>> {
        let records = sqlx::query_as::<_, MessageRecord>(
            r#"
            SELECT * FROM messages
            WHERE content_hash IS NOT NULL
              AND indexed_hash IS NOT NULL
              AND content_hash != indexed_hash
            ORDER BY source, message_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Records with neither hash that nevertheless have an index row.
    pub async fn unhashed_index_entries(&self) -> Result<Vec<MessageKey>> {
        let keys = sqlx::query_as::<_, MessageKey>(&format!(
            r#"
            SELECT m.source AS source, m.message_id AS message_id
            FROM messages m
            JOIN ({}) f ON f.source = m.source AND f.message_id = m.message_id
            WHERE m.content_hash IS NULL AND m.indexed_hash IS NULL
            ORDER BY m.source, m.message_id
            "#,
            INDEX_KEYS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(keys)
    }

    /// Records to feed through indexing: missing, stale or never indexed,
    /// or every record when `force` is set.
    pub async fn records_needing_index(&self, force: bool) -> Result<Vec<MessageRecord>> {
        if force {
            return self.records(None).await;
        }

        let records = sqlx::query_as::<_, MessageRecord>(&format!(
            r#"
            SELECT m.*
            FROM messages m
            LEFT JOIN ({}) f ON f.source = m.source AND f.message_id = m.message_id
            WHERE m.indexed_hash IS NULL
               OR m.content_hash IS NULL
               OR m.indexed_hash != m.content_hash
               OR f.message_id IS NULL
            ORDER BY m.source, m.message_id
            "#,
            INDEX_KEYS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    pub async fn index_row_count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM message_index")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // ========================================================================
    // Search & statistics
    // ========================================================================

    /// Run a user search query.
    ///
    /// # Errors
    ///
    /// `ArchiveError::InvalidQuery` for malformed queries, never a raw FTS5
    /// error.
    #[instrument(skip(self, options), fields(limit = options.limit, offset = options.offset))]
    pub async fn search(&self, query: &str, options: &SearchOptions) -> Result<Vec<SearchHit>> {
        if options.limit <= 0 || options.offset < 0 {
            return Err(ArchiveError::InvalidInput {
                field: "limit".to_string(),
                message: "limit must be positive and offset non-negative".to_string(),
            });
        }

        let parsed = parse_query(query)?;

        let mut conditions: Vec<&str> = Vec::new();
        let mut params: Vec<String> = Vec::new();

        if let Some(source) = &options.source {
            conditions.push("m.source = ?");
            params.push(source.clone());
        }

        for filter in &parsed.filters {
            match filter {
                SqlFilter::Label { value, negated } => {
                    conditions.push(if *negated {
                        "NOT EXISTS (SELECT 1 FROM message_labels l WHERE l.source = m.source AND l.message_id = m.message_id AND l.label = ? COLLATE NOCASE)"
                    } else {
                        "EXISTS (SELECT 1 FROM message_labels l WHERE l.source = m.source AND l.message_id = m.message_id AND l.label = ? COLLATE NOCASE)"
                    });
                    params.push(value.clone());
                }
                SqlFilter::Before { date, negated } => {
                    conditions.push(if *negated {
                        "m.email_date >= ?"
                    } else {
                        "m.email_date < ?"
                    });
                    params.push(date.clone());
                }
                SqlFilter::After { date, negated } => {
                    conditions.push(if *negated {
                        "m.email_date < ?"
                    } else {
                        "m.email_date >= ?"
                    });
                    params.push(date.clone());
                }
                SqlFilter::HasAttachment { negated } => {
                    conditions.push(if *negated {
                        "m.has_attachments = 0"
                    } else {
                        "m.has_attachments = 1"
                    });
                }
            }
        }

        if let Some(excluded) = &parsed.excluded_fts {
            conditions.push(
                "(m.source, m.message_id) NOT IN (SELECT source, message_id FROM message_index WHERE message_index MATCH ?)",
            );
            params.push(excluded.clone());
        }

        let where_sql = if conditions.is_empty() {
            "1 = 1".to_string()
        } else {
            conditions.join(" AND ")
        };

        let order_by = match (options.sort, parsed.fts_query.is_some()) {
            (SortOrder::Relevance, true) => "message_index.rank",
            (SortOrder::DateAsc, _) => "m.email_date ASC",
            _ => "m.email_date DESC",
        };

        let sql = if parsed.fts_query.is_some() {
            format!(
                r#"
                SELECT m.source AS source, m.message_id AS message_id, m.relative_path AS relative_path,
                       m.subject AS subject, m.sender AS sender, m.email_date AS email_date,
                       snippet(message_index, -1, '[', ']', '...', 12) AS snippet,
                       message_index.rank AS rank
                FROM message_index
                JOIN messages m
                  ON m.source = message_index.source AND m.message_id = message_index.message_id
                WHERE message_index MATCH ?
                  AND message_index.rowid IN (
                      SELECT MAX(rowid) FROM message_index GROUP BY source, message_id
                  )
                  AND {}
                ORDER BY {}, m.message_id
                LIMIT ? OFFSET ?
                "#,
                where_sql, order_by
            )
        } else {
            format!(
                r#"
                SELECT m.source AS source, m.message_id AS message_id, m.relative_path AS relative_path,
                       m.subject AS subject, m.sender AS sender, m.email_date AS email_date,
                       NULL AS snippet, NULL AS rank
                FROM messages m
                WHERE {}
                ORDER BY {}, m.message_id
                LIMIT ? OFFSET ?
                "#,
                where_sql, order_by
            )
        };

        debug!(fts = ?parsed.fts_query, filters = parsed.filters.len(), "Executing search");

        let mut statement = sqlx::query_as::<_, SearchHit>(&sql);
        if let Some(fts) = &parsed.fts_query {
            statement = statement.bind(fts.clone());
        }
        for param in params {
            statement = statement.bind(param);
        }
        statement = statement.bind(options.limit).bind(options.offset);

        let hits = statement.fetch_all(&self.pool).await.map_err(|e| match e {
            // Raw FTS5 errors never reach the caller.
            sqlx::Error::Database(db) if db.message().contains("fts5") => {
                warn!(error = %db, "FTS5 rejected parsed query");
                ArchiveError::InvalidQuery(format!("Unsupported search syntax in: {}", query))
            }
            other => ArchiveError::Database(other),
        })?;

        Ok(hits)
    }

    pub async fn stats(&self) -> Result<ArchiveStats> {
        let (total, oldest, newest): (i64, Option<i64>, Option<i64>) = sqlx::query_as(
            "SELECT COUNT(*), MIN(downloaded_at), MAX(downloaded_at) FROM messages",
        )
        .fetch_one(&self.pool)
        .await?;

        let (indexed,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM messages WHERE indexed_hash IS NOT NULL")
                .fetch_one(&self.pool)
                .await?;

        let per_source: Vec<(String, i64)> = sqlx::query_as(
            "SELECT source, COUNT(*) FROM messages GROUP BY source ORDER BY source",
        )
        .fetch_all(&self.pool)
        .await?;

        let labels: Vec<(String, i64)> = sqlx::query_as(
            "SELECT label, COUNT(*) AS n FROM message_labels GROUP BY label ORDER BY n DESC, label",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(ArchiveStats {
            total_messages: total,
            indexed_messages: indexed,
            oldest_download: oldest,
            newest_download: newest,
            per_source,
            labels,
        })
    }
}

/// Write transaction spanning one pipeline batch.
///
/// Dropping the batch without calling [`StoreBatch::commit`] rolls it back.
pub struct StoreBatch {
    tx: Transaction<'static, Sqlite>,
    operations: usize,
}

impl StoreBatch {
    /// Insert a new record, or refresh the content hash of an existing one.
    /// `relative_path` and `downloaded_at` never change once written.
    pub async fn upsert_message(&mut self, record: &MessageRecord) -> Result<()> {
        if record.message_id.is_empty() || record.relative_path.is_empty() {
            return Err(ArchiveError::InvalidInput {
                field: "message".to_string(),
                message: "message_id and relative_path are required".to_string(),
            });
        }

        sqlx::query(
            r#"
            INSERT INTO messages (
                source, message_id, relative_path, downloaded_at,
                content_hash, indexed_hash, email_date, subject, sender, has_attachments
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(source, message_id) DO UPDATE SET
                content_hash = excluded.content_hash
            "#,
        )
        .bind(&record.source)
        .bind(&record.message_id)
        .bind(&record.relative_path)
        .bind(record.downloaded_at)
        .bind(&record.content_hash)
        .bind(&record.indexed_hash)
        .bind(&record.email_date)
        .bind(&record.subject)
        .bind(&record.sender)
        .bind(record.has_attachments)
        .execute(&mut *self.tx)
        .await?;

        self.operations += 1;
        Ok(())
    }

    /// Replace the label rows of a message.
    pub async fn set_labels(&mut self, source: &str, message_id: &str, labels: &[String]) -> Result<()> {
        sqlx::query("DELETE FROM message_labels WHERE source = ? AND message_id = ?")
            .bind(source)
            .bind(message_id)
            .execute(&mut *self.tx)
            .await?;

        for label in labels {
            sqlx::query(
                "INSERT OR IGNORE INTO message_labels (source, message_id, label) VALUES (?, ?, ?)",
            )
            .bind(source)
            .bind(message_id)
            .bind(label)
            .execute(&mut *self.tx)
            .await?;
        }

        self.operations += 1;
        Ok(())
    }

    /// Replace the index entry of a message and record `indexed_hash`.
    pub async fn upsert_index_entry(
        &mut self,
        source: &str,
        message_id: &str,
        fields: &IndexFields,
        indexed_hash: &str,
    ) -> Result<()> {
        sqlx::query("DELETE FROM message_index WHERE source = ? AND message_id = ?")
            .bind(source)
            .bind(message_id)
            .execute(&mut *self.tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO message_index (
                source, message_id, subject, sender, recipients, date, body, attachments
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(source)
        .bind(message_id)
        .bind(&fields.subject)
        .bind(&fields.sender)
        .bind(&fields.recipients)
        .bind(fields.date.as_deref().unwrap_or_default())
        .bind(&fields.body)
        .bind(fields.attachments.join(" "))
        .execute(&mut *self.tx)
        .await?;

        let result = sqlx::query(
            r#"
            UPDATE messages SET
                indexed_hash = ?, email_date = ?, subject = ?, sender = ?, has_attachments = ?
            WHERE source = ? AND message_id = ?
            "#,
        )
        .bind(indexed_hash)
        .bind(&fields.date)
        .bind(&fields.subject)
        .bind(&fields.sender)
        .bind(fields.has_attachments())
        .bind(source)
        .bind(message_id)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ArchiveError::NotFound {
                source_name: source.to_string(),
                message_id: message_id.to_string(),
            });
        }

        self.operations += 1;
        Ok(())
    }

    /// Number of write operations staged in this batch.
    pub fn len(&self) -> usize {
        self.operations
    }

    pub fn is_empty(&self) -> bool {
        self.operations == 0
    }

    /// Commit all staged writes. Returns the number of operations committed.
    pub async fn commit(self) -> Result<usize> {
        let operations = self.operations;
        self.tx.commit().await?;
        debug!(operations = operations, "Committed store batch");
        Ok(operations)
    }

    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(subject: &str, body: &str) -> IndexFields {
        IndexFields {
            subject: subject.to_string(),
            sender: "Alice <alice@example.com>".to_string(),
            recipients: "bob@example.com".to_string(),
            date: Some("2024-03-01T10:00:00+00:00".to_string()),
            body: body.to_string(),
            attachments: vec![],
        }
    }

    async fn store_with(records: &[(&str, &str)]) -> MetadataStore {
        let store = MetadataStore::in_memory().await.unwrap();
        let mut batch = store.begin_batch().await.unwrap();
        for (id, subject) in records {
            let record = MessageRecord::new("s", *id, format!("{}.eml", id), 100, format!("h-{}", id));
            batch.upsert_message(&record).await.unwrap();
            batch
                .upsert_index_entry("s", id, &fields(subject, "body text"), &format!("h-{}", id))
                .await
                .unwrap();
        }
        batch.commit().await.unwrap();
        store
    }

    async fn insert_raw_index_row(store: &MetadataStore, id: &str, subject: &str) {
        sqlx::query("INSERT INTO message_index (source, message_id, subject) VALUES ('s', ?, ?)")
            .bind(id)
            .bind(subject)
            .execute(store.pool())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_upsert_keeps_path_and_download_time() {
        let store = MetadataStore::in_memory().await.unwrap();

        let mut batch = store.begin_batch().await.unwrap();
        batch
            .upsert_message(&MessageRecord::new("s", "1", "a.eml", 100, "h1"))
            .await
            .unwrap();
        batch
            .upsert_message(&MessageRecord::new("s", "1", "b.eml", 200, "h2"))
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);
        batch.commit().await.unwrap();

        let record = store.get("s", "1").await.unwrap().unwrap();
        assert_eq!(record.relative_path, "a.eml");
        assert_eq!(record.downloaded_at, 100);
        assert_eq!(record.content_hash.as_deref(), Some("h2"));
        assert_eq!(store.count(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dropped_batch_rolls_back() {
        let store = MetadataStore::in_memory().await.unwrap();

        {
            let mut batch = store.begin_batch().await.unwrap();
            batch
                .upsert_message(&MessageRecord::new("s", "1", "a.eml", 100, "h1"))
                .await
                .unwrap();
        }

        assert!(store.downloaded_ids("s").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_index_entry_sets_indexed_hash() {
        let store = store_with(&[("1", "Quarterly report")]).await;

        let record = store.get("s", "1").await.unwrap().unwrap();
        assert_eq!(record.indexed_hash, record.content_hash);
        assert_eq!(record.subject.as_deref(), Some("Quarterly report"));
        assert_eq!(record.email_date.as_deref(), Some("2024-03-01T10:00:00+00:00"));
        assert_eq!(store.index_row_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reindex_replaces_entry() {
        let store = store_with(&[("1", "First")]).await;

        let mut batch = store.begin_batch().await.unwrap();
        batch
            .upsert_index_entry("s", "1", &fields("Second", "body"), "h-1")
            .await
            .unwrap();
        batch.commit().await.unwrap();

        assert_eq!(store.index_row_count().await.unwrap(), 1);
        assert!(store.index_duplicates().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_index_entry_for_unknown_message_fails() {
        let store = MetadataStore::in_memory().await.unwrap();
        let mut batch = store.begin_batch().await.unwrap();

        let result = batch
            .upsert_index_entry("s", "missing", &fields("x", "y"), "h")
            .await;

        assert!(matches!(result, Err(ArchiveError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_unlabeled_records() {
        let store = store_with(&[("1", "x"), ("2", "y")]).await;

        let mut batch = store.begin_batch().await.unwrap();
        batch.set_labels("s", "1", &["INBOX".to_string()]).await.unwrap();
        batch.commit().await.unwrap();

        let unlabeled = store.unlabeled_records("s").await.unwrap();
        assert_eq!(unlabeled.len(), 1);
        assert_eq!(unlabeled[0].message_id, "2");
        assert!(store.unlabeled_records("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_labels_are_replaced() {
        let store = store_with(&[("1", "x")]).await;

        let mut batch = store.begin_batch().await.unwrap();
        batch
            .set_labels("s", "1", &["INBOX".to_string(), "Work".to_string()])
            .await
            .unwrap();
        batch
            .set_labels("s", "1", &["Work".to_string(), "Work".to_string()])
            .await
            .unwrap();
        batch.commit().await.unwrap();

        assert_eq!(store.labels("s", "1").await.unwrap(), vec!["Work".to_string()]);
    }

    #[tokio::test]
    async fn test_cursor_round_trip() {
        let store = MetadataStore::in_memory().await.unwrap();

        assert!(store.load_cursor("s").await.unwrap().is_none());
        store.save_cursor("s", "{\"history_id\":\"10\"}").await.unwrap();
        store.save_cursor("s", "{\"history_id\":\"12\"}").await.unwrap();
        assert_eq!(
            store.load_cursor("s").await.unwrap().as_deref(),
            Some("{\"history_id\":\"12\"}")
        );
        assert!(store.load_cursor("other").await.unwrap().is_none());

        store.clear_cursor("s").await.unwrap();
        assert!(store.load_cursor("s").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_rows_keep_latest() {
        let store = store_with(&[("1", "Original"), ("2", "Other")]).await;
        insert_raw_index_row(&store, "1", "Newest copy").await;

        let duplicates = store.index_duplicates().await.unwrap();
        assert_eq!(duplicates.len(), 1);
        assert_eq!(duplicates[0].message_id, "1");
        assert_eq!(duplicates[0].row_count, 2);

        assert_eq!(store.remove_duplicate_index_rows().await.unwrap(), 1);

        let (subject,): (String,) =
            sqlx::query_as("SELECT subject FROM message_index WHERE message_id = '1'")
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert_eq!(subject, "Newest copy");
        assert_eq!(store.index_row_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_search_returns_one_hit_per_message_with_duplicate_rows() {
        let store = store_with(&[("1", "Quarterly report"), ("2", "Lunch")]).await;
        insert_raw_index_row(&store, "1", "Quarterly report draft").await;

        let hits = store.search("quarterly", &SearchOptions::default()).await.unwrap();

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].message_id, "1");
        // The latest row is the one searched, matching the repair policy
        assert!(hits[0].snippet.as_deref().unwrap_or_default().contains("draft"));
    }

    #[tokio::test]
    async fn test_orphans_and_missing_entries() {
        let store = store_with(&[("1", "Indexed")]).await;
        insert_raw_index_row(&store, "ghost", "No record").await;

        let mut batch = store.begin_batch().await.unwrap();
        batch
            .upsert_message(&MessageRecord::new("s", "2", "2.eml", 100, "h-2"))
            .await
            .unwrap();
        batch.commit().await.unwrap();

        assert_eq!(
            store.index_orphans().await.unwrap(),
            vec![MessageKey::new("s", "ghost")]
        );
        assert_eq!(
            store.missing_index_entries().await.unwrap(),
            vec![MessageKey::new("s", "2")]
        );

        assert_eq!(store.remove_index_orphans().await.unwrap(), 1);
        assert!(store.index_orphans().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_and_unhashed_records() {
        let store = store_with(&[("1", "a"), ("2", "b")]).await;

        sqlx::query("UPDATE messages SET content_hash = 'changed' WHERE message_id = '1'")
            .execute(store.pool())
            .await
            .unwrap();
        sqlx::query(
            "UPDATE messages SET content_hash = NULL, indexed_hash = NULL WHERE message_id = '2'",
        )
        .execute(store.pool())
        .await
        .unwrap();

        let stale = store.stale_records().await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].message_id, "1");

        assert_eq!(
            store.unhashed_index_entries().await.unwrap(),
            vec![MessageKey::new("s", "2")]
        );

        let needing: Vec<String> = store
            .records_needing_index(false)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.message_id)
            .collect();
        assert_eq!(needing, vec!["1".to_string(), "2".to_string()]);
        assert_eq!(store.records_needing_index(true).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_stats() {
        let store = store_with(&[("1", "a"), ("2", "b")]).await;
        let mut batch = store.begin_batch().await.unwrap();
        batch
            .upsert_message(&MessageRecord::new("t", "9", "9.eml", 50, "h"))
            .await
            .unwrap();
        batch.set_labels("s", "1", &["INBOX".to_string()]).await.unwrap();
        batch.set_labels("s", "2", &["INBOX".to_string()]).await.unwrap();
        batch.commit().await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_messages, 3);
        assert_eq!(stats.indexed_messages, 2);
        assert_eq!(stats.oldest_download, Some(50));
        assert_eq!(stats.newest_download, Some(100));
        assert_eq!(
            stats.per_source,
            vec![("s".to_string(), 2), ("t".to_string(), 1)]
        );
        assert_eq!(stats.labels, vec![("INBOX".to_string(), 2)]);
    }
}

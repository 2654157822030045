//! # SQLite Pool
//!
//! Opens the connection pool behind [`MetadataStore`](crate::MetadataStore)
//! and brings the schema up to date with the embedded migrations.
//!
//! File databases run in WAL mode so searches and verification can read
//! while a sync run writes. `sqlite::memory:` gives every connection its own
//! database, so in-memory pools hold exactly one connection that never
//! expires.

use crate::error::{ArchiveError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseLocation {
    File(PathBuf),
    Memory,
}

/// Pool sizing and timeouts.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub location: DatabaseLocation,
    pub max_connections: u32,
    /// How long a caller waits for a free connection
    pub acquire_timeout: Duration,
    /// How long SQLite retries a locked database before failing a statement
    pub busy_timeout: Duration,
    pub idle_timeout: Option<Duration>,
}

impl PoolSettings {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            location: DatabaseLocation::File(path.into()),
            max_connections: 5,
            acquire_timeout: Duration::from_secs(30),
            busy_timeout: Duration::from_secs(5),
            idle_timeout: Some(Duration::from_secs(600)),
        }
    }

    pub fn memory() -> Self {
        Self {
            location: DatabaseLocation::Memory,
            max_connections: 1,
            acquire_timeout: Duration::from_secs(30),
            busy_timeout: Duration::from_secs(5),
            idle_timeout: None,
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    fn connect_options(&self) -> Result<SqliteConnectOptions> {
        let options = match &self.location {
            DatabaseLocation::File(path) => SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal),
            DatabaseLocation::Memory => SqliteConnectOptions::from_str("sqlite::memory:")?,
        };

        Ok(options
            .foreign_keys(true)
            .busy_timeout(self.busy_timeout))
    }
}

/// Open a pool and apply pending migrations.
pub async fn open_pool(settings: &PoolSettings) -> Result<SqlitePool> {
    let options = settings.connect_options()?;
    let in_memory = settings.location == DatabaseLocation::Memory;

    let pool = SqlitePoolOptions::new()
        .min_connections(1)
        .max_connections(settings.max_connections)
        .acquire_timeout(settings.acquire_timeout)
        .idle_timeout(settings.idle_timeout)
        .max_lifetime(if in_memory { None } else { Some(Duration::from_secs(1800)) })
        .connect_with(options)
        .await
        .map_err(|e| {
            warn!(error = %e, location = ?settings.location, "Cannot open archive database");
            ArchiveError::Database(e)
        })?;

    debug!("Applying schema migrations");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| ArchiveError::Migration(e.to_string()))?;

    info!(location = ?settings.location, "Archive database ready");
    Ok(pool)
}

/// Migrated single-connection in-memory pool.
pub async fn open_memory_pool() -> Result<SqlitePool> {
    open_pool(&PoolSettings::memory()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_pool_creates_database_in_wal_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.db");

        let pool = open_pool(&PoolSettings::file(&path)).await.unwrap();
        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool)
            .await
            .unwrap();
        pool.close().await;

        assert!(path.exists());
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[tokio::test]
    async fn test_foreign_keys_enforced() {
        let pool = open_memory_pool().await.unwrap();

        let (enabled,): (i32,) = sqlx::query_as("PRAGMA foreign_keys")
            .fetch_one(&pool)
            .await
            .unwrap();

        assert_eq!(enabled, 1);
    }

    #[tokio::test]
    async fn test_schema_is_migrated() {
        let pool = open_memory_pool().await.unwrap();

        for table in ["messages", "message_labels", "sync_state", "message_index"] {
            let (count,): (i32,) =
                sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE name = ?")
                    .bind(table)
                    .fetch_one(&pool)
                    .await
                    .unwrap();

            assert_eq!(count, 1, "missing table {}", table);
        }
    }

    #[test]
    fn test_memory_pool_is_single_connection() {
        let settings = PoolSettings::memory();
        assert_eq!(settings.max_connections, 1);
        assert_eq!(settings.idle_timeout, None);

        let file = PoolSettings::file("/tmp/archive.db").max_connections(8);
        assert_eq!(file.max_connections, 8);
        assert_eq!(
            file.location,
            DatabaseLocation::File(PathBuf::from("/tmp/archive.db"))
        );
    }
}

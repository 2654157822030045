//! # Archive Metadata Module
//!
//! Owns the archive's metadata database and its full-text search index.
//!
//! ## Overview
//!
//! This module manages:
//! - SQLite database schema and migrations
//! - Archived-message records keyed by `(source, message_id)`
//! - Per-source sync state such as resumable cursors
//! - The FTS5 message index and its consistency checks
//! - The user search query language

pub mod db;
pub mod error;
pub mod models;
pub mod query;
pub mod store;

pub use db::{open_memory_pool, open_pool, DatabaseLocation, PoolSettings};
pub use error::{ArchiveError, Result};
pub use models::{
    ArchiveStats, DuplicateIndexGroup, IndexFields, IndexState, MessageKey, MessageRecord,
    SearchHit, SearchOptions, SortOrder,
};
pub use query::{escape_fts5_value, parse_query, ParsedQuery, SqlFilter};
pub use store::{MetadataStore, StoreBatch, CURSOR_KEY};

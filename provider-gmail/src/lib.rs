//! # Gmail Provider
//!
//! Implements the `SourceAdapter` contract for the Gmail API v1.
//!
//! ## Overview
//!
//! This module provides:
//! - Paginated message listing, optionally date-bounded
//! - Incremental planning from the mailbox `historyId`
//! - Raw message download with bounded parallelism
//! - Label name resolution through a per-run cache
//! - Rate-limit backoff for the affected messages

pub mod connector;
pub mod error;
pub mod types;

pub use connector::GmailSource;
pub use error::{GmailError, Result};

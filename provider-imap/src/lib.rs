//! # IMAP Provider
//!
//! Implements the `SourceAdapter` contract for IMAP mailboxes.
//!
//! ## Overview
//!
//! IMAP has no mailbox-wide change feed. This provider walks every
//! selectable folder, derives message identity from the `Message-ID` header
//! and tracks progress per folder as `(max UID, UIDVALIDITY)`:
//!
//! - Full scans list each folder's UIDs, optionally bounded by `SINCE`/`BEFORE`
//! - Incremental scans search `UID <max+1>:*` and rescan folders whose
//!   UIDVALIDITY changed
//! - Messages present in several folders are downloaded once and labelled
//!   with every folder they appear in
//!
//! All protocol traffic goes through the [`ImapTransport`] seam so the scan
//! logic can be exercised without a server.

pub mod connector;
pub mod error;
pub mod transport;

pub use connector::{ImapServer, ImapSource};
pub use error::{ImapError, Result};
pub use transport::{FolderInfo, ImapTransport, MailboxStatus, NativeImapTransport};

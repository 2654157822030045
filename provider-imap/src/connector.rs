//! IMAP connector implementation
//!
//! A folder-scan source. Message identifiers are `folder:uidvalidity:uid`,
//! so a UID reused after a UIDVALIDITY reset names a different message. The
//! cursor records `(max UID, UIDVALIDITY)` per folder.

use async_trait::async_trait;
use chrono::NaiveDate;
use core_auth::{Credential, CredentialKind};
use core_runtime::config::SyncOptions;
use core_runtime::logging::redact_if_sensitive;
use core_sync::{
    message_identity, BatchFetch, DateRange, DedupStrategy, Deduplicator, FetchedMessage,
    FolderCursor, FolderScan, IncrementalPlan, LabelFetch, ScannedMessage, SourceAdapter,
    SyncCursor, SyncError, FOLDER_LABEL_HEADER,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::error::{ImapError, Result};
use crate::transport::{ImapTransport, NativeImapTransport, DEFAULT_PORT};

/// UIDs per header FETCH
const HEADER_FETCH_CHUNK: usize = 50;

/// UIDs per body FETCH
const BODY_FETCH_CHUNK: usize = 25;

/// Server endpoint of an IMAP account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImapServer {
    pub host: String,
    pub port: u16,
}

impl ImapServer {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

/// IMAP mailbox as a folder-scan source.
///
/// Labels are the folders a message was found in during the latest
/// enumeration or incremental plan, so fetches should follow planning on
/// the same instance.
pub struct ImapSource {
    transport: Arc<Mutex<Box<dyn ImapTransport>>>,
    source_name: String,
    include_labels: bool,
    dedup: Deduplicator,
    /// candidate id -> folders it appears in
    labels: Mutex<HashMap<String, Vec<String>>>,
}

/// One folder's scan result.
struct FolderSnapshot {
    scan: FolderScan,
    cursor: FolderCursor,
}

impl ImapSource {
    /// Create a source for `account` over an established transport.
    pub fn new(transport: Box<dyn ImapTransport>, account: &str, options: &SyncOptions) -> Self {
        Self {
            transport: Arc::new(Mutex::new(transport)),
            source_name: Self::source_name_for(account),
            include_labels: options.include_labels,
            dedup: Deduplicator::from_options(options),
            labels: Mutex::new(HashMap::new()),
        }
    }

    /// Open a TLS session to `server` with a password credential.
    #[instrument(skip(credential, options), fields(host = %server.host))]
    pub async fn connect(
        server: &ImapServer,
        credential: &Credential,
        options: &SyncOptions,
    ) -> Result<Self> {
        let (username, password) = match &credential.kind {
            CredentialKind::Password { username, password } => (username.clone(), password.clone()),
            CredentialKind::OAuth { .. } => {
                return Err(ImapError::UnsupportedCredential(credential.source.clone()))
            }
        };

        let host = server.host.clone();
        let port = server.port;
        let account = username.clone();
        let transport = tokio::task::spawn_blocking(move || {
            NativeImapTransport::connect(&host, port, &username, &password)
        })
        .await
        .map_err(|e| ImapError::Connection(e.to_string()))??;

        Ok(Self::new(Box::new(transport), &account, options))
    }

    pub fn source_name_for(account: &str) -> String {
        format!("imap:{}", account)
    }

    /// Close the session.
    pub async fn logout(&self) -> Result<()> {
        self.blocking(|transport| transport.logout()).await
    }

    /// Run `op` against the transport on the blocking pool.
    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn ImapTransport) -> Result<T> + Send + 'static,
    {
        let transport = Arc::clone(&self.transport);
        tokio::task::spawn_blocking(move || {
            let mut guard = transport
                .lock()
                .map_err(|_| ImapError::Connection("transport lock poisoned".to_string()))?;
            op(guard.as_mut())
        })
        .await
        .map_err(|e| ImapError::Connection(e.to_string()))?
    }

    fn sync_error(&self, error: ImapError) -> SyncError {
        error.into_sync_error(&self.source_name)
    }

    /// Selectable folders that are not excluded, in server order.
    fn scan_folders(transport: &mut dyn ImapTransport, dedup: &Deduplicator) -> Result<Vec<String>> {
        Ok(transport
            .list_folders()?
            .into_iter()
            .filter(|folder| folder.selectable && dedup.should_scan(&folder.name))
            .map(|folder| folder.name)
            .collect())
    }

    /// Remember the folders of each candidate for the following fetches.
    fn remember_labels(&self, labels: HashMap<String, Vec<String>>) {
        match self.labels.lock() {
            Ok(mut guard) => *guard = labels,
            Err(_) => warn!("Label map lock poisoned; labels fall back to the owning folder"),
        }
    }

    fn labels_for(&self, ids: &[String]) -> HashMap<String, Vec<String>> {
        let Ok(guard) = self.labels.lock() else {
            return HashMap::new();
        };
        ids.iter()
            .filter_map(|id| guard.get(id).map(|labels| (id.clone(), labels.clone())))
            .collect()
    }

    fn has_labels(&self) -> bool {
        self.labels.lock().map(|guard| !guard.is_empty()).unwrap_or(false)
    }

    /// Whether the folder holding the download counts as one of its labels.
    /// Under an authoritative folder only auxiliary folders are labels.
    fn owner_is_label(&self) -> bool {
        matches!(self.dedup.strategy(), DedupStrategy::General)
    }
}

/// IMAP search criteria for a date range. `BEFORE` is exclusive, matching
/// `DateRange::until`.
fn date_search(range: &DateRange) -> String {
    let mut criteria = Vec::new();
    if let Some(since) = range.since {
        criteria.push(format!("SINCE {}", imap_date(since)));
    }
    if let Some(until) = range.until {
        criteria.push(format!("BEFORE {}", imap_date(until)));
    }
    if criteria.is_empty() {
        "ALL".to_string()
    } else {
        criteria.join(" ")
    }
}

/// `DD-Mon-YYYY`
fn imap_date(date: NaiveDate) -> String {
    date.format("%d-%b-%Y").to_string()
}

fn composite_id(folder: &str, uid_validity: u32, uid: u32) -> String {
    format!("{}:{}:{}", folder, uid_validity, uid)
}

/// A parsed `folder:uidvalidity:uid` identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MessageLocation<'a> {
    folder: &'a str,
    uid_validity: u32,
    uid: u32,
}

/// Split `folder:uidvalidity:uid`. Folder names may themselves contain `:`.
fn parse_identifier(id: &str) -> Result<MessageLocation<'_>> {
    let invalid = || ImapError::InvalidIdentifier(id.to_string());

    let (rest, uid) = id.rsplit_once(':').ok_or_else(invalid)?;
    let (folder, uid_validity) = rest.rsplit_once(':').ok_or_else(invalid)?;
    let uid = uid.parse::<u32>().map_err(|_| invalid())?;
    let uid_validity = uid_validity.parse::<u32>().map_err(|_| invalid())?;
    if folder.is_empty() {
        return Err(invalid());
    }

    Ok(MessageLocation {
        folder,
        uid_validity,
        uid,
    })
}

/// Message-ID of each UID, fetched in chunks. The folder must be open.
fn identities(transport: &mut dyn ImapTransport, uids: &[u32]) -> Result<HashMap<u32, String>> {
    let mut found = HashMap::new();
    for chunk in uids.chunks(HEADER_FETCH_CHUNK) {
        for (uid, header) in transport.fetch_headers(chunk)? {
            if let Some(identity) = message_identity(&header) {
                found.insert(uid, identity);
            }
        }
    }
    Ok(found)
}

/// Search the open folder and collect identities for the matches. UIDs at
/// or below `floor` are dropped; `UID n:*` always matches the
/// highest UID even when it is below `n`.
fn scan_folder(
    transport: &mut dyn ImapTransport,
    folder: &str,
    query: &str,
    floor: u32,
) -> Result<(Vec<u32>, HashMap<u32, String>)> {
    let uids: Vec<u32> = transport
        .uid_search(query)?
        .into_iter()
        .filter(|uid| *uid > floor)
        .collect();
    let identities = identities(transport, &uids)?;
    debug!(folder, found = uids.len(), "Scanned folder");
    Ok((uids, identities))
}

fn folder_scan(
    folder: &str,
    uid_validity: u32,
    uids: &[u32],
    identities: &HashMap<u32, String>,
) -> FolderScan {
    FolderScan {
        folder: folder.to_string(),
        messages: uids
            .iter()
            .map(|uid| {
                ScannedMessage::new(
                    composite_id(folder, uid_validity, *uid),
                    identities.get(uid).cloned(),
                )
            })
            .collect(),
    }
}

/// Where to resume `folder` from, given its current UIDVALIDITY.
fn resume_floor(folder: &str, previous: Option<&FolderCursor>, uid_validity: u32) -> u32 {
    match previous {
        Some(cursor) if cursor.uid_validity == uid_validity => cursor.max_uid,
        Some(cursor) => {
            info!(
                folder,
                old = cursor.uid_validity,
                new = uid_validity,
                "UIDVALIDITY changed, rescanning folder"
            );
            0
        }
        None => 0,
    }
}

fn incremental_scan(
    transport: &mut dyn ImapTransport,
    dedup: &Deduplicator,
    previous: &BTreeMap<String, FolderCursor>,
) -> Result<Vec<FolderSnapshot>> {
    let mut snapshots = Vec::new();

    for folder in ImapSource::scan_folders(transport, dedup)? {
        let status = transport.examine(&folder)?;
        let floor = resume_floor(&folder, previous.get(&folder), status.uid_validity);
        let query = if floor > 0 {
            format!("UID {}:*", floor + 1)
        } else {
            "ALL".to_string()
        };

        let (uids, identities) = scan_folder(transport, &folder, &query, floor)?;
        let max_uid = uids.iter().copied().max().unwrap_or(0).max(floor);
        snapshots.push(FolderSnapshot {
            scan: folder_scan(&folder, status.uid_validity, &uids, &identities),
            cursor: FolderCursor {
                max_uid,
                uid_validity: status.uid_validity,
            },
        });
    }

    Ok(snapshots)
}

#[async_trait]
impl SourceAdapter for ImapSource {
    fn source_name(&self) -> &str {
        &self.source_name
    }

    fn label_header(&self) -> &'static str {
        FOLDER_LABEL_HEADER
    }

    #[instrument(skip(self), fields(source = %redact_if_sensitive("source", &self.source_name)))]
    async fn enumerate_all(&self, range: &DateRange) -> core_sync::Result<Vec<String>> {
        let dedup = self.dedup.clone();
        let query = date_search(range);

        let scans = self
            .blocking(move |transport| {
                let mut scans = Vec::new();
                for folder in ImapSource::scan_folders(transport, &dedup)? {
                    let status = transport.examine(&folder)?;
                    let (uids, identities) = scan_folder(transport, &folder, &query, 0)?;
                    scans.push(folder_scan(&folder, status.uid_validity, &uids, &identities));
                }
                Ok(scans)
            })
            .await
            .map_err(|e| self.sync_error(e))?;

        let outcome = self.dedup.resolve(&scans);
        info!(
            folders = scans.len(),
            unique = outcome.candidates.len(),
            duplicates = outcome.duplicates,
            "Enumerated IMAP folders"
        );

        self.remember_labels(outcome.labels);
        Ok(outcome.candidates)
    }

    #[instrument(skip(self, cursor), fields(source = %redact_if_sensitive("source", &self.source_name)))]
    async fn plan_incremental(&self, cursor: &SyncCursor) -> core_sync::Result<IncrementalPlan> {
        let SyncCursor::FolderScan { folders } = cursor else {
            warn!("Saved cursor is not a folder-scan cursor");
            return Ok(IncrementalPlan {
                candidates: Vec::new(),
                new_cursor: None,
            });
        };

        let dedup = self.dedup.clone();
        let previous = folders.clone();
        let snapshots = self
            .blocking(move |transport| incremental_scan(transport, &dedup, &previous))
            .await
            .map_err(|e| self.sync_error(e))?;

        let mut next = BTreeMap::new();
        let mut scans = Vec::with_capacity(snapshots.len());
        for snapshot in snapshots {
            next.insert(snapshot.scan.folder.clone(), snapshot.cursor);
            scans.push(snapshot.scan);
        }

        let outcome = self.dedup.resolve(&scans);
        info!(
            new_messages = outcome.candidates.len(),
            duplicates = outcome.duplicates,
            "Planned incremental IMAP scan"
        );

        self.remember_labels(outcome.labels);
        Ok(IncrementalPlan {
            candidates: outcome.candidates,
            new_cursor: Some(SyncCursor::FolderScan { folders: next }),
        })
    }

    async fn fetch_one(&self, id: &str) -> core_sync::Result<FetchedMessage> {
        let ids = [id.to_string()];
        let mut results = self.fetch_batch(&ids).await?;
        results
            .remove(id)
            .unwrap_or_else(|| Err(SyncError::Source(format!("No data returned for {}", id))))
    }

    #[instrument(skip(self, ids), fields(source = %redact_if_sensitive("source", &self.source_name), count = ids.len()))]
    async fn fetch_batch(&self, ids: &[String]) -> core_sync::Result<BatchFetch> {
        let mut results = BatchFetch::new();

        // folder -> [(id, uid_validity, uid)], in first-seen order
        let mut groups: Vec<(String, Vec<(String, u32, u32)>)> = Vec::new();
        for id in ids {
            match parse_identifier(id) {
                Ok(location) => {
                    let item = (id.clone(), location.uid_validity, location.uid);
                    match groups.iter_mut().find(|(f, _)| f == location.folder) {
                        Some((_, items)) => items.push(item),
                        None => groups.push((location.folder.to_string(), vec![item])),
                    }
                }
                Err(e) => {
                    results.insert(id.clone(), Err(self.sync_error(e)));
                }
            }
        }

        let labels = if self.include_labels {
            self.labels_for(ids)
        } else {
            HashMap::new()
        };
        let include_labels = self.include_labels;
        let owner_is_label = self.owner_is_label();
        let source_name = self.source_name.clone();

        let fetched = self
            .blocking(move |transport| {
                let mut fetched = BatchFetch::new();
                for (folder, items) in groups {
                    let status = match transport.examine(&folder) {
                        Ok(status) => status,
                        Err(e) => {
                            warn!(folder = %folder, error = %e, "Cannot select folder");
                            for (id, _, _) in items {
                                fetched.insert(
                                    id,
                                    Err(SyncError::Source(format!("Cannot select folder: {}", folder))),
                                );
                            }
                            continue;
                        }
                    };

                    // UIDs from an older epoch may now name other messages
                    let (current, outdated): (Vec<_>, Vec<_>) = items
                        .into_iter()
                        .partition(|(_, uid_validity, _)| *uid_validity == status.uid_validity);
                    for (id, uid_validity, _) in outdated {
                        fetched.insert(
                            id,
                            Err(SyncError::Source(format!(
                                "UIDVALIDITY of {} is now {}, not {}",
                                folder, status.uid_validity, uid_validity
                            ))),
                        );
                    }

                    for chunk in current.chunks(BODY_FETCH_CHUNK) {
                        let uids: Vec<u32> = chunk.iter().map(|(_, _, uid)| *uid).collect();
                        let mut bodies: HashMap<u32, Vec<u8>> = match transport.fetch_bodies(&uids) {
                            Ok(bodies) => bodies.into_iter().collect(),
                            Err(e) => {
                                let message = e.to_string();
                                for (id, _, _) in chunk {
                                    fetched.insert(id.clone(), Err(SyncError::Source(message.clone())));
                                }
                                continue;
                            }
                        };

                        for (id, _, uid) in chunk {
                            let outcome = match bodies.remove(uid) {
                                Some(raw) => {
                                    let folders = match labels.get(id) {
                                        Some(folders) => folders.clone(),
                                        None if include_labels && owner_is_label => {
                                            vec![folder.clone()]
                                        }
                                        None => Vec::new(),
                                    };
                                    Ok(FetchedMessage::new(raw, folders))
                                }
                                None => Err(SyncError::Source(format!("No data for UID {}", uid))),
                            };
                            fetched.insert(id.clone(), outcome);
                        }
                    }
                }
                Ok(fetched)
            })
            .await
            .map_err(|e| e.into_sync_error(&source_name))?;

        results.extend(fetched);
        Ok(results)
    }

    /// Labels from the same folder mapping a sync uses. Without a mapping
    /// from an earlier plan on this instance, the folders are enumerated
    /// first. Messages the enumeration no longer finds fall back to their
    /// own folder when that folder counts as a label.
    #[instrument(skip(self, ids), fields(source = %redact_if_sensitive("source", &self.source_name), count = ids.len()))]
    async fn fetch_labels(&self, ids: &[String]) -> core_sync::Result<LabelFetch> {
        let mut results = LabelFetch::new();
        if !self.include_labels {
            return Ok(results);
        }

        if !self.has_labels() {
            self.enumerate_all(&DateRange::default()).await?;
        }
        let mut known = self.labels_for(ids);
        let owner_is_label = self.owner_is_label();

        for id in ids {
            let outcome = match (known.remove(id), parse_identifier(id)) {
                (Some(labels), _) => Ok(labels),
                (None, Ok(location)) if owner_is_label => Ok(vec![location.folder.to_string()]),
                (None, Ok(_)) => continue,
                (None, Err(e)) => Err(self.sync_error(e)),
            };
            results.insert(id.clone(), outcome);
        }

        debug!(resolved = results.len(), "Resolved folder labels");
        Ok(results)
    }

    #[instrument(skip(self), fields(source = %redact_if_sensitive("source", &self.source_name)))]
    async fn current_cursor(&self) -> core_sync::Result<SyncCursor> {
        let dedup = self.dedup.clone();
        let folders = self
            .blocking(move |transport| {
                let mut folders = BTreeMap::new();
                for folder in ImapSource::scan_folders(transport, &dedup)? {
                    let status = transport.examine(&folder)?;
                    let max_uid = transport
                        .uid_search("ALL")?
                        .into_iter()
                        .max()
                        .unwrap_or(0);
                    folders.insert(
                        folder,
                        FolderCursor {
                            max_uid,
                            uid_validity: status.uid_validity,
                        },
                    );
                }
                Ok(folders)
            })
            .await
            .map_err(|e| self.sync_error(e))?;

        Ok(SyncCursor::FolderScan { folders })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_identifier() {
        assert_eq!(
            parse_identifier("INBOX:7:42").unwrap(),
            MessageLocation {
                folder: "INBOX",
                uid_validity: 7,
                uid: 42
            }
        );
        assert_eq!(parse_identifier("Projects:2024:3:7").unwrap().folder, "Projects:2024");
        assert_eq!(parse_identifier(&composite_id("A:B", 9, 1)).unwrap().uid_validity, 9);
        assert!(parse_identifier("INBOX:42").is_err());
        assert!(parse_identifier("INBOX:x:42").is_err());
        assert!(parse_identifier("INBOX:7:abc").is_err());
        assert!(parse_identifier(":7:5").is_err());
    }

    #[test]
    fn test_date_search() {
        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2024, 1, 5),
            NaiveDate::from_ymd_opt(2024, 2, 1),
        );
        assert_eq!(date_search(&range), "SINCE 05-Jan-2024 BEFORE 01-Feb-2024");
        assert_eq!(date_search(&DateRange::default()), "ALL");
    }

    #[test]
    fn test_resume_floor() {
        let cursor = FolderCursor {
            max_uid: 40,
            uid_validity: 7,
        };
        assert_eq!(resume_floor("INBOX", Some(&cursor), 7), 40);
        assert_eq!(resume_floor("INBOX", Some(&cursor), 8), 0);
        assert_eq!(resume_floor("INBOX", None, 7), 0);
    }
}

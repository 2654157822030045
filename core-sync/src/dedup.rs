//! # Cross-Folder Deduplication
//!
//! A folder-scan source can hold the same message in several folders. The
//! [`Deduplicator`] collapses those occurrences to one download and turns
//! the extra folders into labels.
//!
//! Identity comes from message content (the `Message-ID` header), never
//! from transport sequence numbers, which are folder-local.
//!
//! ## Strategies
//!
//! - [`DedupStrategy::Authoritative`]: one folder holds every message
//!   exactly once and is the only download source. Other folders only
//!   contribute labels.
//! - [`DedupStrategy::General`]: the first folder in scan order to yield an
//!   identity owns the download; later folders become labels. Occurrences
//!   without an identity are always downloaded.

use core_runtime::config::SyncOptions;
use std::collections::{HashMap, HashSet};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupStrategy {
    General,
    Authoritative { folder: String },
}

impl DedupStrategy {
    pub fn from_authoritative(folder: Option<&str>) -> Self {
        match folder {
            Some(folder) => DedupStrategy::Authoritative {
                folder: folder.to_string(),
            },
            None => DedupStrategy::General,
        }
    }
}

/// One message occurrence found while scanning a folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedMessage {
    /// Source identifier of this occurrence
    pub id: String,
    /// Content identity, if one could be extracted
    pub identity: Option<String>,
}

impl ScannedMessage {
    pub fn new(id: impl Into<String>, identity: Option<String>) -> Self {
        Self {
            id: id.into(),
            identity: identity.filter(|i| !i.trim().is_empty()),
        }
    }
}

/// Occurrences found in one folder, in the folder's natural order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderScan {
    pub folder: String,
    pub messages: Vec<ScannedMessage>,
}

/// Download set and label map produced from a scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupOutcome {
    /// Identifiers to download, in scan order
    pub candidates: Vec<String>,
    /// Labels per candidate. Candidates without an entry carry no labels.
    pub labels: HashMap<String, Vec<String>>,
    /// Occurrences collapsed into an earlier candidate
    pub duplicates: usize,
}

impl DedupOutcome {
    pub fn labels_for(&self, id: &str) -> Option<&[String]> {
        self.labels.get(id).map(Vec::as_slice)
    }
}

#[derive(Debug, Clone)]
pub struct Deduplicator {
    strategy: DedupStrategy,
    excluded: HashSet<String>,
}

impl Deduplicator {
    pub fn new(strategy: DedupStrategy, exclude_folders: &[String]) -> Self {
        Self {
            strategy,
            excluded: exclude_folders.iter().cloned().collect(),
        }
    }

    /// Strategy and exclusions as configured for a sync.
    pub fn from_options(options: &SyncOptions) -> Self {
        let strategy = DedupStrategy::from_authoritative(options.authoritative_folder.as_deref());
        Self::new(strategy, &options.exclude_folders)
    }

    pub fn strategy(&self) -> &DedupStrategy {
        &self.strategy
    }

    /// Whether `folder` is looked at at all.
    pub fn should_scan(&self, folder: &str) -> bool {
        !self.excluded.contains(folder)
    }

    /// Whether messages in `folder` may be downloaded.
    pub fn is_download_folder(&self, folder: &str) -> bool {
        match &self.strategy {
            DedupStrategy::General => self.should_scan(folder),
            DedupStrategy::Authoritative { folder: authoritative } => folder == authoritative,
        }
    }

    /// Resolve scanned folders into a download set. Scans of excluded
    /// folders are ignored.
    pub fn resolve(&self, scans: &[FolderScan]) -> DedupOutcome {
        let scans: Vec<&FolderScan> = scans
            .iter()
            .filter(|scan| self.should_scan(&scan.folder))
            .collect();

        let outcome = match &self.strategy {
            DedupStrategy::General => resolve_general(&scans),
            DedupStrategy::Authoritative { folder } => resolve_authoritative(folder, &scans),
        };

        debug!(
            candidates = outcome.candidates.len(),
            duplicates = outcome.duplicates,
            "Resolved folder occurrences"
        );
        outcome
    }
}

fn push_label(labels: &mut Vec<String>, folder: &str) {
    if !labels.iter().any(|l| l == folder) {
        labels.push(folder.to_string());
    }
}

fn resolve_general(scans: &[&FolderScan]) -> DedupOutcome {
    let mut outcome = DedupOutcome::default();
    // identity -> canonical identifier
    let mut canonical: HashMap<&str, &str> = HashMap::new();

    for scan in scans {
        for message in &scan.messages {
            match message.identity.as_deref() {
                Some(identity) => match canonical.get(identity) {
                    Some(primary) => {
                        let labels = outcome.labels.entry(primary.to_string()).or_default();
                        push_label(labels, &scan.folder);
                        outcome.duplicates += 1;
                    }
                    None => {
                        canonical.insert(identity, &message.id);
                        outcome.candidates.push(message.id.clone());
                        outcome
                            .labels
                            .insert(message.id.clone(), vec![scan.folder.clone()]);
                    }
                },
                None => {
                    outcome.candidates.push(message.id.clone());
                    outcome
                        .labels
                        .insert(message.id.clone(), vec![scan.folder.clone()]);
                }
            }
        }
    }

    outcome
}

fn resolve_authoritative(authoritative: &str, scans: &[&FolderScan]) -> DedupOutcome {
    let mut outcome = DedupOutcome::default();

    // identity -> folders other than the authoritative one
    let mut folders_by_identity: HashMap<&str, Vec<String>> = HashMap::new();
    for scan in scans.iter().filter(|s| s.folder != authoritative) {
        for message in &scan.messages {
            if let Some(identity) = message.identity.as_deref() {
                push_label(
                    folders_by_identity.entry(identity).or_default(),
                    &scan.folder,
                );
            }
        }
    }

    let Some(primary) = scans.iter().find(|s| s.folder == authoritative) else {
        return outcome;
    };

    let mut seen: HashSet<&str> = HashSet::new();
    for message in &primary.messages {
        outcome.candidates.push(message.id.clone());

        let Some(identity) = message.identity.as_deref() else {
            continue;
        };
        if !seen.insert(identity) {
            outcome.duplicates += 1;
        }
        if let Some(folders) = folders_by_identity.get(identity) {
            outcome.labels.insert(message.id.clone(), folders.clone());
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(folder: &str, messages: &[(&str, Option<&str>)]) -> FolderScan {
        FolderScan {
            folder: folder.to_string(),
            messages: messages
                .iter()
                .map(|(id, identity)| ScannedMessage::new(*id, identity.map(str::to_string)))
                .collect(),
        }
    }

    #[test]
    fn test_general_first_folder_wins() {
        let dedup = Deduplicator::new(DedupStrategy::General, &[]);
        let outcome = dedup.resolve(&[
            scan("INBOX", &[("INBOX:1", Some("<a@x>")), ("INBOX:2", Some("<b@x>"))]),
            scan("Work", &[("Work:7", Some("<a@x>"))]),
        ]);

        assert_eq!(outcome.candidates, vec!["INBOX:1", "INBOX:2"]);
        assert_eq!(
            outcome.labels_for("INBOX:1").unwrap(),
            &["INBOX".to_string(), "Work".to_string()]
        );
        assert_eq!(outcome.labels_for("INBOX:2").unwrap(), &["INBOX".to_string()]);
        assert_eq!(outcome.duplicates, 1);
    }

    #[test]
    fn test_general_without_identity_is_never_deduplicated() {
        let dedup = Deduplicator::new(DedupStrategy::General, &[]);
        let outcome = dedup.resolve(&[
            scan("INBOX", &[("INBOX:1", None)]),
            scan("Work", &[("Work:1", None), ("Work:2", Some("  "))]),
        ]);

        assert_eq!(outcome.candidates, vec!["INBOX:1", "Work:1", "Work:2"]);
        assert_eq!(outcome.duplicates, 0);
    }

    #[test]
    fn test_general_is_order_dependent_and_reproducible() {
        let dedup = Deduplicator::new(DedupStrategy::General, &[]);
        let scans = [
            scan("Archive", &[("Archive:3", Some("<a@x>"))]),
            scan("INBOX", &[("INBOX:1", Some("<a@x>"))]),
        ];

        let first = dedup.resolve(&scans);
        let second = dedup.resolve(&scans);

        assert_eq!(first.candidates, vec!["Archive:3"]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_excluded_folders_are_ignored() {
        let dedup = Deduplicator::new(DedupStrategy::General, &["Spam".to_string()]);
        let outcome = dedup.resolve(&[
            scan("Spam", &[("Spam:1", Some("<a@x>"))]),
            scan("INBOX", &[("INBOX:4", Some("<a@x>"))]),
        ]);

        assert!(!dedup.should_scan("Spam"));
        assert_eq!(outcome.candidates, vec!["INBOX:4"]);
        assert_eq!(outcome.labels_for("INBOX:4").unwrap(), &["INBOX".to_string()]);
    }

    #[test]
    fn test_from_options_skips_configured_folders() {
        let options = SyncOptions {
            authoritative_folder: Some("Archive".to_string()),
            ..SyncOptions::default()
        };
        let dedup = Deduplicator::from_options(&options);

        for folder in &options.exclude_folders {
            assert!(options.is_excluded(folder));
            assert!(!dedup.should_scan(folder));
        }
        assert!(dedup.should_scan("INBOX"));
        assert!(dedup.is_download_folder("Archive"));
        assert!(!dedup.is_download_folder("INBOX"));
    }

    #[test]
    fn test_authoritative_downloads_only_from_primary() {
        let strategy = DedupStrategy::from_authoritative(Some("[Gmail]/All Mail"));
        let dedup = Deduplicator::new(strategy, &[]);
        let outcome = dedup.resolve(&[
            scan("INBOX", &[("INBOX:1", Some("<a@x>")), ("INBOX:2", Some("<new@x>"))]),
            scan(
                "[Gmail]/All Mail",
                &[("[Gmail]/All Mail:10", Some("<a@x>")), ("[Gmail]/All Mail:11", None)],
            ),
            scan("Work", &[("Work:5", Some("<a@x>"))]),
        ]);

        assert!(dedup.is_download_folder("[Gmail]/All Mail"));
        assert!(!dedup.is_download_folder("INBOX"));
        assert_eq!(
            outcome.candidates,
            vec!["[Gmail]/All Mail:10", "[Gmail]/All Mail:11"]
        );
        assert_eq!(
            outcome.labels_for("[Gmail]/All Mail:10").unwrap(),
            &["INBOX".to_string(), "Work".to_string()]
        );
        assert!(outcome.labels_for("[Gmail]/All Mail:11").is_none());
    }

    #[test]
    fn test_authoritative_folder_missing() {
        let dedup = Deduplicator::new(
            DedupStrategy::Authoritative {
                folder: "All".to_string(),
            },
            &[],
        );
        let outcome = dedup.resolve(&[scan("INBOX", &[("INBOX:1", Some("<a@x>"))])]);
        assert!(outcome.candidates.is_empty());
    }
}

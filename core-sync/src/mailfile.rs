//! Message file helpers: label header injection, archive layout, atomic
//! writes and content hashing.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub const GMAIL_LABEL_HEADER: &str = "X-Gmail-Labels";
pub const FOLDER_LABEL_HEADER: &str = "X-Folder-Labels";

const ACCOUNTS_DIR: &str = "accounts";
const UNKNOWN_DATE: &str = "unknown";

/// Hex SHA-256 of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Insert `<header>: a, b` right after the first line of `raw`, using the
/// same terminator as that line. Bytes without a line break are returned
/// unchanged, as are messages with no labels.
pub fn inject_labels(raw: &[u8], header: &str, labels: &[String]) -> Vec<u8> {
    if labels.is_empty() {
        return raw.to_vec();
    }

    let Some(newline) = raw.iter().position(|&b| b == b'\n') else {
        return raw.to_vec();
    };

    let terminator: &[u8] = if newline > 0 && raw[newline - 1] == b'\r' {
        b"\r\n"
    } else {
        b"\n"
    };

    let line = format!("{}: {}", header, labels.join(", "));
    let split = newline + 1;

    let mut out = Vec::with_capacity(raw.len() + line.len() + terminator.len());
    out.extend_from_slice(&raw[..split]);
    out.extend_from_slice(line.as_bytes());
    out.extend_from_slice(terminator);
    out.extend_from_slice(&raw[split..]);
    out
}

/// Drop every `<header>:` field from the header block of `raw`, folded
/// continuation lines included. The body is never touched.
pub fn strip_label_header(raw: &[u8], header: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut rest = raw;
    let mut skipping = false;

    while !rest.is_empty() {
        let end = rest
            .iter()
            .position(|&b| b == b'\n')
            .map_or(rest.len(), |i| i + 1);
        let (line, tail) = rest.split_at(end);

        let content = line
            .strip_suffix(b"\n")
            .map(|l| l.strip_suffix(b"\r").unwrap_or(l))
            .unwrap_or(line);
        if content.is_empty() {
            // Blank line: the body starts here
            out.extend_from_slice(rest);
            break;
        }

        let continuation = matches!(content[0], b' ' | b'\t');
        if !continuation {
            skipping = is_field(content, header);
        }
        if !skipping {
            out.extend_from_slice(line);
        }
        rest = tail;
    }

    out
}

fn is_field(line: &[u8], name: &str) -> bool {
    line.len() > name.len()
        && line[..name.len()].eq_ignore_ascii_case(name.as_bytes())
        && line[name.len()] == b':'
}

/// Swap the label header of an archived message for one carrying `labels`.
pub fn replace_labels(raw: &[u8], header: &str, labels: &[String]) -> Vec<u8> {
    inject_labels(&strip_label_header(raw, header), header, labels)
}

/// Directory-safe form of a source name.
pub fn source_dir_name(source: &str) -> String {
    source
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '@' | '+') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Archive-relative path of a message:
/// `accounts/<source>/<YYYY>/<MM>/<YYYYMMDD_HHMMSS>_<h12>.eml`, or
/// `accounts/<source>/unknown/unknown_<h12>.eml` without a date.
pub fn relative_message_path(source: &str, message_id: &str, date: Option<DateTime<Utc>>) -> PathBuf {
    let id_hash = content_hash(message_id.as_bytes());
    let short = &id_hash[..12];

    let mut path = PathBuf::from(ACCOUNTS_DIR);
    path.push(source_dir_name(source));

    match date {
        Some(date) => {
            path.push(date.format("%Y").to_string());
            path.push(date.format("%m").to_string());
            path.push(format!("{}_{}.eml", date.format("%Y%m%d_%H%M%S"), short));
        }
        None => {
            path.push(UNKNOWN_DATE);
            path.push(format!("{}_{}.eml", UNKNOWN_DATE, short));
        }
    }

    path
}

/// Path string as stored in the metadata store, `/`-separated on every
/// platform.
pub fn path_to_record(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Write `bytes` to `path` through a temporary file in the same directory
/// renamed over the target. A failed write leaves no file under `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent directory")
    })?;
    std::fs::create_dir_all(dir)?;

    let mut temp = tempfile::Builder::new()
        .prefix(".incoming-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    persist(temp, path)
}

fn persist(temp: NamedTempFile, path: &Path) -> std::io::Result<()> {
    // Dropping the returned handle on error removes the temp file.
    temp.persist(path).map(|_| ()).map_err(|e| e.error)
}

/// Hex SHA-256 of the file at `path`.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(content_hash(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn labels(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_inject_labels_crlf() {
        let raw = b"From: a@example.com\r\nSubject: hi\r\n\r\nbody";
        let out = inject_labels(raw, GMAIL_LABEL_HEADER, &labels(&["INBOX", "Work"]));
        assert_eq!(
            out,
            b"From: a@example.com\r\nX-Gmail-Labels: INBOX, Work\r\nSubject: hi\r\n\r\nbody".to_vec()
        );
    }

    #[test]
    fn test_inject_labels_lf() {
        let raw = b"From: a@example.com\nSubject: hi\n\nbody";
        let out = inject_labels(raw, FOLDER_LABEL_HEADER, &labels(&["INBOX"]));
        assert_eq!(
            out,
            b"From: a@example.com\nX-Folder-Labels: INBOX\nSubject: hi\n\nbody".to_vec()
        );
    }

    #[test]
    fn test_inject_labels_without_line_break() {
        let raw = b"no line break at all";
        assert_eq!(inject_labels(raw, GMAIL_LABEL_HEADER, &labels(&["INBOX"])), raw.to_vec());
        assert_eq!(inject_labels(b"a\nb", GMAIL_LABEL_HEADER, &[]), b"a\nb".to_vec());
    }

    #[test]
    fn test_replace_labels_swaps_existing_header() {
        let raw = b"From: a@example.com\r\nX-Gmail-Labels: INBOX\r\nSubject: hi\r\n\r\nX-Gmail-Labels: body text\r\n";
        let out = replace_labels(raw, GMAIL_LABEL_HEADER, &labels(&["INBOX", "Receipts"]));
        assert_eq!(
            out,
            b"From: a@example.com\r\nX-Gmail-Labels: INBOX, Receipts\r\nSubject: hi\r\n\r\nX-Gmail-Labels: body text\r\n".to_vec()
        );
    }

    #[test]
    fn test_strip_label_header_handles_folding_and_case() {
        let raw = b"From: a@example.com\nx-folder-labels: INBOX,\n Archive\nSubject: hi\n\nbody";
        assert_eq!(
            strip_label_header(raw, FOLDER_LABEL_HEADER),
            b"From: a@example.com\nSubject: hi\n\nbody".to_vec()
        );
        // No labels left means no header at all
        assert_eq!(
            replace_labels(raw, FOLDER_LABEL_HEADER, &[]),
            b"From: a@example.com\nSubject: hi\n\nbody".to_vec()
        );
        // Other fields sharing the prefix survive
        let other = b"From: a\nX-Folder-Labels-Extra: keep\n\nbody";
        assert_eq!(strip_label_header(other, FOLDER_LABEL_HEADER), other.to_vec());
    }

    #[test]
    fn test_relative_message_path() {
        let date = Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap();
        let path = relative_message_path("gmail:alice@example.com", "18c2f", Some(date));
        let hash = content_hash(b"18c2f");

        assert_eq!(
            path_to_record(&path),
            format!("accounts/gmail_alice@example.com/2024/03/20240305_140709_{}.eml", &hash[..12])
        );

        let unknown = relative_message_path("imap:bob", "INBOX:4", None);
        assert!(path_to_record(&unknown).starts_with("accounts/imap_bob/unknown/unknown_"));
    }

    #[test]
    fn test_write_atomic_replaces_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts/x/2024/01/a.eml");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
        assert_eq!(hash_file(&path).unwrap(), content_hash(b"second"));
    }

    #[test]
    fn test_content_hash_is_hex_sha256() {
        assert_eq!(
            content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}

//! IMAP transport seam
//!
//! [`ImapTransport`] covers exactly the commands the folder scan issues.
//! Calls are blocking; the connector runs them on the blocking pool.

use crate::error::{ImapError, Result};
use imap::types::NameAttribute;
use native_tls::{TlsConnector, TlsStream};
use std::net::TcpStream;
use std::time::Duration;
use tracing::{debug, info};

/// Default IMAPS port
pub const DEFAULT_PORT: u16 = 993;

const IO_TIMEOUT: Duration = Duration::from_secs(60);

/// A folder as reported by `LIST`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderInfo {
    pub name: String,
    /// `false` for `\Noselect` containers such as `[Gmail]`
    pub selectable: bool,
}

impl FolderInfo {
    pub fn new(name: impl Into<String>, selectable: bool) -> Self {
        Self {
            name: name.into(),
            selectable,
        }
    }
}

/// Folder state returned by `EXAMINE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxStatus {
    /// 0 when the server did not report one
    pub uid_validity: u32,
    pub exists: u32,
}

/// Blocking IMAP session.
///
/// Search and fetch commands apply to the folder most recently opened with
/// [`examine`](ImapTransport::examine). Folders are always opened read-only.
pub trait ImapTransport: Send {
    fn list_folders(&mut self) -> Result<Vec<FolderInfo>>;

    fn examine(&mut self, folder: &str) -> Result<MailboxStatus>;

    /// `UID SEARCH <query>`; UIDs in ascending order.
    fn uid_search(&mut self, query: &str) -> Result<Vec<u32>>;

    /// Header block of each UID. UIDs the server returned nothing for are
    /// absent from the result.
    fn fetch_headers(&mut self, uids: &[u32]) -> Result<Vec<(u32, Vec<u8>)>>;

    /// Full RFC 5322 bytes of each UID, fetched without setting `\Seen`.
    fn fetch_bodies(&mut self, uids: &[u32]) -> Result<Vec<(u32, Vec<u8>)>>;

    fn logout(&mut self) -> Result<()>;
}

/// [`ImapTransport`] over an implicit-TLS connection.
pub struct NativeImapTransport {
    session: imap::Session<TlsStream<TcpStream>>,
}

impl NativeImapTransport {
    /// Connect, read the greeting and log in.
    pub fn connect(host: &str, port: u16, username: &str, password: &str) -> Result<Self> {
        let tls = TlsConnector::builder()
            .build()
            .map_err(|e| ImapError::Tls(e.to_string()))?;

        let tcp = TcpStream::connect((host, port))
            .map_err(|e| ImapError::Connection(format!("{}:{}: {}", host, port, e)))?;
        tcp.set_read_timeout(Some(IO_TIMEOUT))
            .and_then(|_| tcp.set_write_timeout(Some(IO_TIMEOUT)))
            .map_err(|e| ImapError::Connection(e.to_string()))?;

        let stream = tls
            .connect(host, tcp)
            .map_err(|e| ImapError::Tls(e.to_string()))?;

        let mut client = imap::Client::new(stream);
        client.read_greeting()?;

        let session = client
            .login(username, password)
            .map_err(|(error, _client)| match error {
                imap::Error::No(reason) => ImapError::AuthenticationFailed(reason),
                other => ImapError::from(other),
            })?;

        info!(host, port, "IMAP session established");
        Ok(Self { session })
    }
}

fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

impl ImapTransport for NativeImapTransport {
    fn list_folders(&mut self) -> Result<Vec<FolderInfo>> {
        let names = self.session.list(Some(""), Some("*"))?;
        Ok(names
            .iter()
            .map(|name| {
                let selectable = !name
                    .attributes()
                    .iter()
                    .any(|attribute| matches!(attribute, NameAttribute::NoSelect));
                FolderInfo::new(name.name(), selectable)
            })
            .collect())
    }

    fn examine(&mut self, folder: &str) -> Result<MailboxStatus> {
        let mailbox = self
            .session
            .examine(folder)
            .map_err(|e| ImapError::FolderUnavailable {
                folder: folder.to_string(),
                reason: e.to_string(),
            })?;

        Ok(MailboxStatus {
            uid_validity: mailbox.uid_validity.unwrap_or(0),
            exists: mailbox.exists,
        })
    }

    fn uid_search(&mut self, query: &str) -> Result<Vec<u32>> {
        let mut uids: Vec<u32> = self.session.uid_search(query)?.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    fn fetch_headers(&mut self, uids: &[u32]) -> Result<Vec<(u32, Vec<u8>)>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let fetches = self.session.uid_fetch(uid_set(uids), "BODY.PEEK[HEADER]")?;
        Ok(fetches
            .iter()
            .filter_map(|fetch| Some((fetch.uid?, fetch.header()?.to_vec())))
            .collect())
    }

    fn fetch_bodies(&mut self, uids: &[u32]) -> Result<Vec<(u32, Vec<u8>)>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let fetches = self.session.uid_fetch(uid_set(uids), "BODY.PEEK[]")?;
        debug!(requested = uids.len(), returned = fetches.len(), "Fetched message bodies");
        Ok(fetches
            .iter()
            .filter_map(|fetch| Some((fetch.uid?, fetch.body()?.to_vec())))
            .collect())
    }

    fn logout(&mut self) -> Result<()> {
        self.session.logout()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uid_set() {
        assert_eq!(uid_set(&[3, 17, 42]), "3,17,42");
        assert_eq!(uid_set(&[]), "");
    }
}

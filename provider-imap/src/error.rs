//! Error types for the IMAP provider

use core_sync::SyncError;
use thiserror::Error;

/// IMAP provider errors
#[derive(Error, Debug)]
pub enum ImapError {
    /// TCP connect failed or the connection dropped
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("TLS error: {0}")]
    Tls(String),

    /// Server rejected the login
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Credential for the source is not a username/password pair
    #[error("Source {0} needs a password credential")]
    UnsupportedCredential(String),

    /// `NO`/`BAD` response or an unparseable reply
    #[error("IMAP protocol error: {0}")]
    Protocol(String),

    #[error("Cannot select folder {folder}: {reason}")]
    FolderUnavailable { folder: String, reason: String },

    /// Identifier is not of the form `folder:uidvalidity:uid`
    #[error("Invalid message identifier: {0}")]
    InvalidIdentifier(String),
}

/// Result type for IMAP operations
pub type Result<T> = std::result::Result<T, ImapError>;

impl From<imap::Error> for ImapError {
    fn from(error: imap::Error) -> Self {
        match error {
            imap::Error::Io(e) => ImapError::Connection(e.to_string()),
            imap::Error::ConnectionLost => ImapError::Connection("connection lost".to_string()),
            imap::Error::No(reason) | imap::Error::Bad(reason) => ImapError::Protocol(reason),
            other => ImapError::Protocol(other.to_string()),
        }
    }
}

impl ImapError {
    /// Map into the sync engine's error taxonomy for `source`.
    pub fn into_sync_error(self, source: &str) -> SyncError {
        match self {
            ImapError::Connection(_) | ImapError::Tls(_) => SyncError::Transient(self.to_string()),
            ImapError::AuthenticationFailed(reason) => {
                SyncError::Auth(core_auth::AuthError::AuthenticationFailed {
                    source_name: source.to_string(),
                    reason,
                })
            }
            ImapError::UnsupportedCredential(_) => {
                SyncError::Auth(core_auth::AuthError::AuthenticationFailed {
                    source_name: source.to_string(),
                    reason: self.to_string(),
                })
            }
            other => SyncError::Source(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ImapError::FolderUnavailable {
            folder: "Archive".to_string(),
            reason: "no such mailbox".to_string(),
        };

        assert_eq!(
            error.to_string(),
            "Cannot select folder Archive: no such mailbox"
        );
    }

    #[test]
    fn test_sync_error_classification() {
        let source = "imap:bob@example.org";

        assert!(ImapError::Connection("reset".to_string())
            .into_sync_error(source)
            .is_retryable());
        assert!(matches!(
            ImapError::AuthenticationFailed("bad password".to_string()).into_sync_error(source),
            SyncError::Auth(_)
        ));
        assert!(matches!(
            ImapError::Protocol("BAD command".to_string()).into_sync_error(source),
            SyncError::Source(_)
        ));
    }

    #[test]
    fn test_from_imap_error() {
        assert!(matches!(
            ImapError::from(imap::Error::No("Mailbox does not exist".to_string())),
            ImapError::Protocol(reason) if reason == "Mailbox does not exist"
        ));
        assert!(matches!(
            ImapError::from(imap::Error::ConnectionLost),
            ImapError::Connection(_)
        ));
    }
}

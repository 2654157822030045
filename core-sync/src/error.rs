use core_archive::ArchiveError;
use core_auth::AuthError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// The remote no longer honors the saved cursor (history purged,
    /// validity lost). Callers fall back to a full scan.
    #[error("Cursor expired for {source_name}: {reason}")]
    CursorExpired { source_name: String, reason: String },

    #[error("Rate limited by remote: {0}")]
    RateLimited(String),

    #[error("Transient remote error: {0}")]
    Transient(String),

    #[error("Source error: {0}")]
    Source(String),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store error: {0}")]
    Store(#[from] ArchiveError),

    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Whether a whole-batch retry with backoff may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::RateLimited(_) | SyncError::Transient(_))
    }

    pub fn is_cursor_expired(&self) -> bool {
        matches!(self, SyncError::CursorExpired { .. })
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(SyncError::RateLimited("429".into()).is_retryable());
        assert!(SyncError::Transient("timeout".into()).is_retryable());
        assert!(!SyncError::Source("404".into()).is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());

        let expired = SyncError::CursorExpired {
            source_name: "gmail:a".into(),
            reason: "history purged".into(),
        };
        assert!(expired.is_cursor_expired());
        assert!(!expired.is_retryable());
    }
}

//! Error types for the Gmail provider

use core_sync::SyncError;
use thiserror::Error;

/// Gmail provider errors
#[derive(Error, Debug)]
pub enum GmailError {
    /// Access token rejected
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// API request returned an error
    #[error("Gmail API error (status {status_code}): {message}")]
    ApiError { status_code: u16, message: String },

    /// 429, or 403 with a rate-limit reason
    #[error("Rate limit exceeded (status {status_code})")]
    RateLimitExceeded { status_code: u16 },

    /// 5xx from the API
    #[error("Gmail server error (status {status_code})")]
    ServerError { status_code: u16 },

    #[error("Message not found: {message_id}")]
    MessageNotFound { message_id: String },

    /// `startHistoryId` is older than the retained history
    #[error("History id {history_id} is no longer available")]
    HistoryExpired { history_id: String },

    /// Failed to parse API response
    #[error("Failed to parse API response: {0}")]
    ParseError(String),

    #[error(transparent)]
    BridgeError(#[from] bridge_traits::error::BridgeError),
}

/// Result type for Gmail operations
pub type Result<T> = std::result::Result<T, GmailError>;

impl GmailError {
    /// Map into the sync engine's error taxonomy for `source`.
    pub fn into_sync_error(self, source: &str) -> SyncError {
        match self {
            GmailError::RateLimitExceeded { .. } => SyncError::RateLimited(self.to_string()),
            GmailError::ServerError { .. } => SyncError::Transient(self.to_string()),
            GmailError::BridgeError(ref e) if e.is_transient() => {
                SyncError::Transient(self.to_string())
            }
            GmailError::HistoryExpired { history_id } => SyncError::CursorExpired {
                source_name: source.to_string(),
                reason: format!("history id {} expired", history_id),
            },
            GmailError::AuthenticationFailed(reason) => {
                SyncError::Auth(core_auth::AuthError::AuthenticationFailed {
                    source_name: source.to_string(),
                    reason,
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
        let error = GmailError::ApiError {
            status_code: 400,
            message: "Invalid query".to_string(),
        };

        assert_eq!(error.to_string(), "Gmail API error (status 400): Invalid query");
    }

    #[test]
    fn test_sync_error_classification() {
        let source = "gmail:alice@example.com";

        assert!(GmailError::RateLimitExceeded { status_code: 429 }
            .into_sync_error(source)
            .is_retryable());
        assert!(GmailError::ServerError { status_code: 503 }
            .into_sync_error(source)
            .is_retryable());
        assert!(GmailError::HistoryExpired {
            history_id: "42".to_string()
        }
        .into_sync_error(source)
        .is_cursor_expired());
        assert!(matches!(
            GmailError::MessageNotFound {
                message_id: "x".to_string()
            }
            .into_sync_error(source),
            SyncError::Source(_)
        ));
    }
}

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Source {source_name} authentication failed: {reason}")]
    AuthenticationFailed { source_name: String, reason: String },

    #[error("Token refresh failed: {0}")]
    TokenRefreshFailed(String),

    #[error("Secure storage unavailable: {0}")]
    SecureStorageUnavailable(String),

    #[error("Stored credential for {source_name} is corrupted: {reason}")]
    CredentialCorrupted { source_name: String, reason: String },

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Not authenticated for source {0}")]
    NotAuthenticated(String),
}

pub type Result<T> = std::result::Result<T, AuthError>;

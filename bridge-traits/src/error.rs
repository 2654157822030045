use thiserror::Error;

/// Failure reported by a host bridge.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The host cannot provide the capability at all
    #[error("Bridge capability unavailable: {0}")]
    Unavailable(String),

    /// The request never produced a response
    #[error("Request failed: {0}")]
    Request(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Secret storage error: {0}")]
    SecretStore(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Timeouts and connection-level I/O failures may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, BridgeError::Timeout(_) | BridgeError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

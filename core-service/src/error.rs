use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Service initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Configuration error: {0}")]
    Config(#[from] core_runtime::Error),

    #[error("Authentication error: {0}")]
    Auth(#[from] core_auth::AuthError),

    #[error("Sync error: {0}")]
    Sync(#[from] core_sync::SyncError),

    #[error("Archive error: {0}")]
    Archive(#[from] core_archive::ArchiveError),

    #[cfg(feature = "imap")]
    #[error("IMAP error: {0}")]
    Imap(#[from] provider_imap::ImapError),
}

pub type Result<T> = std::result::Result<T, ServiceError>;

//! Errors raised while assembling the runtime configuration.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or incomplete configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// A host bridge the requested operation depends on was not provided
    #[error("{bridge} is not available: {hint}")]
    MissingBridge { bridge: &'static str, hint: String },
}

pub type Result<T> = std::result::Result<T, Error>;

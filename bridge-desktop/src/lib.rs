//! # Desktop Bridge Implementations
//!
//! Host bridges for desktop builds (macOS, Windows, Linux):
//! - [`ReqwestHttpClient`] for the Gmail REST API, TLS via rustls
//! - [`KeyringSecureStore`] for OAuth tokens and IMAP passwords
//!
//! The keychain backend sits behind the default `secure-store` feature.

mod http;

#[cfg(feature = "secure-store")]
mod secure_store;

pub use http::ReqwestHttpClient;

#[cfg(feature = "secure-store")]
pub use secure_store::{KeyringSecureStore, SERVICE_NAME};

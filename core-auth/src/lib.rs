//! # Authentication Module
//!
//! Credential seam between the archive core and the host.
//!
//! ## Overview
//!
//! The core never runs OAuth or IMAP login flows. Hosts acquire credentials
//! however they like and hand them over through a [`CredentialProvider`];
//! the core only asks for a credential per source, refreshes it when it has
//! expired, and saves the result.
//!
//! ## Features
//!
//! - OAuth token and password credentials with redacted `Debug`
//! - Expiry checks with a refresh buffer
//! - Secure persistence via the platform [`SecureStore`](bridge_traits::SecureStore)
//! - Pluggable refresh-token exchange via [`TokenRefresher`]

pub mod error;
pub mod provider;
pub mod types;

pub use error::{AuthError, Result};
pub use provider::{CredentialProvider, StoredCredentialProvider, TokenRefresher};
pub use types::{Credential, CredentialKind};

//! Mailvault umbrella crate.
//!
//! Re-exports [`core_service`] so hosts can depend on one crate and pick
//! providers with the `gmail` / `imap` features; `desktop-shims` pulls in
//! the keyring store and the reqwest client.

#[cfg(any(feature = "desktop-shims", feature = "gmail", feature = "imap"))]
pub use core_service::*;

//! # Host Bridge Traits
//!
//! Seams between the mail archive core and the host it runs in.
//!
//! ## Overview
//!
//! The core never opens sockets to REST APIs, touches a keychain or reads
//! the wall clock on its own. It asks for these capabilities through the
//! traits below, and each host supplies an implementation.
//!
//! ## Traits
//!
//! - [`HttpClient`](http::HttpClient) - Async HTTP for REST mail sources
//! - [`SecureStore`](storage::SecureStore) - Credential persistence (Keychain, Secret Service)
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//!
//! ## Error Handling
//!
//! Implementations translate their platform failures into
//! [`BridgeError`](error::BridgeError); the sync engine only cares whether
//! an error [is transient](error::BridgeError::is_transient).
//!
//! Every trait is `Send + Sync`; one instance is shared by all tasks of a
//! run.

pub mod error;
pub mod http;
pub mod storage;
pub mod time;

pub use error::BridgeError;

pub use http::{HttpClient, HttpRequest, HttpResponse, RetryPolicy};
pub use storage::SecureStore;
pub use time::{Clock, FixedClock, SystemClock};

//! # Core Runtime Module
//!
//! Provides foundational runtime infrastructure for the mail archive core:
//! - Logging and tracing infrastructure
//! - Archive configuration and validation
//!
//! ## Overview
//!
//! This crate contains the runtime utilities that other modules depend on.
//! It establishes the logging conventions and the configuration surface the
//! sync engine reads.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{ArchiveConfig, ArchiveConfigBuilder};
pub use error::{Error, Result};

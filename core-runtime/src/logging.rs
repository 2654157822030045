//! # Logging & Tracing Infrastructure
//!
//! Installs a `tracing-subscriber` registry for the archive:
//! - an `EnvFilter` that puts every workspace crate at one level and keeps
//!   HTTP/TLS/SQL internals at warn
//! - one fmt layer, pretty, JSON or compact, on stderr or stdout
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::logging::{init_logging, LogFormat, LogLevel, LoggingConfig};
//!
//! init_logging(
//!     LoggingConfig::default()
//!         .with_format(LogFormat::Compact)
//!         .with_level(LogLevel::Debug),
//! )?;
//! tracing::info!("Archive opened");
//! ```
//!
//! Mailbox content is never logged. Sync code logs identifiers, counts and
//! folder names; anything that may hold an address or a secret goes through
//! [`redact_if_sensitive`] first.

use crate::error::{Error, Result};

use serde::{Deserialize, Serialize};
use std::io;
use tracing::Subscriber;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{filter::EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, Layer};

/// Targets that follow the configured level.
const WORKSPACE_CRATES: &[&str] = &[
    "core_runtime",
    "core_auth",
    "core_archive",
    "core_sync",
    "core_service",
    "provider_gmail",
    "provider_imap",
    "bridge_desktop",
];

/// Dependencies that are only interesting when they fail.
const QUIET_DEPENDENCIES: &[&str] = &["h2", "hyper", "reqwest", "rustls", "sqlx"];

/// Field names whose values are never logged.
const SECRET_FIELDS: &[&str] = &["token", "password", "secret", "authorization", "bearer"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, colored; for terminals
    Pretty,
    /// One JSON object per event
    Json,
    /// One line per event
    Compact,
}

impl Default for LogFormat {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            LogFormat::Pretty
        } else {
            LogFormat::Json
        }
    }
}

/// Where formatted events go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    /// Keeps stdout free for command output
    #[default]
    Stderr,
    Stdout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub level: LogLevel,
    /// Full `EnvFilter` directive string; replaces the level-based default
    pub filter: Option<String>,
    /// Print the event target (module path)
    pub display_target: bool,
    pub output: LogOutput,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: LogLevel::Info,
            filter: None,
            display_target: true,
            output: LogOutput::default(),
        }
    }
}

impl LoggingConfig {
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    /// e.g. `"core_sync=debug,provider_imap=trace"`
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_target(mut self, display: bool) -> Self {
        self.display_target = display;
        self
    }

    pub fn with_output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }
}

/// Install the global subscriber. Only the first call in a process
/// succeeds.
pub fn init_logging(config: LoggingConfig) -> Result<()> {
    let filter = build_filter(&config)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer(&config))
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to initialize logging: {}", e)))
}

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    let directives = config
        .filter
        .clone()
        .unwrap_or_else(|| default_filter(config.level));

    EnvFilter::try_new(&directives)
        .map_err(|e| Error::Config(format!("Invalid log filter '{}': {}", directives, e)))
}

fn default_filter(level: LogLevel) -> String {
    WORKSPACE_CRATES
        .iter()
        .map(|krate| format!("{}={}", krate, level.directive()))
        .chain(QUIET_DEPENDENCIES.iter().map(|dep| format!("{}=warn", dep)))
        .collect::<Vec<_>>()
        .join(",")
}

fn fmt_layer<S>(config: &LoggingConfig) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a> + 'static,
{
    let writer = match config.output {
        LogOutput::Stderr => BoxMakeWriter::new(io::stderr),
        LogOutput::Stdout => BoxMakeWriter::new(io::stdout),
    };
    let layer = fmt::layer()
        .with_target(config.display_target)
        .with_writer(writer);

    match config.format {
        LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Json => layer
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .boxed(),
        LogFormat::Compact => layer.compact().boxed(),
    }
}

/// Mask a field value before it reaches a log line.
///
/// Values of secret-looking fields are replaced entirely. E-mail addresses
/// keep their first character, and a `kind:` prefix such as the one on
/// source names is kept as is.
///
/// ```ignore
/// use core_runtime::logging::redact_if_sensitive;
///
/// tracing::info!(account = %redact_if_sensitive("account", &account), "Connecting");
/// ```
pub fn redact_if_sensitive(field_name: &str, value: &str) -> String {
    let field = field_name.to_ascii_lowercase();
    if SECRET_FIELDS.iter().any(|secret| field.contains(secret)) {
        return "[REDACTED]".to_string();
    }

    match value.split_once('@') {
        Some((local, domain)) if domain.contains('.') => {
            let (prefix, user) = match local.rsplit_once(':') {
                Some((kind, user)) => (format!("{}:", kind), user),
                None => (String::new(), local),
            };
            let first: String = user.chars().take(1).collect();
            format!("{}{}***@[REDACTED]", prefix, first)
        }
        _ => value.to_string(),
    }
}

/// Basename of a `/` or `\` separated path.
pub fn strip_path(path: &str) -> &str {
    path.rsplit(|c| c == '/' || c == '\\').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = LoggingConfig::default()
            .with_format(LogFormat::Json)
            .with_level(LogLevel::Debug)
            .with_filter("core_sync=trace")
            .with_target(false)
            .with_output(LogOutput::Stdout);

        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.level, LogLevel::Debug);
        assert_eq!(config.filter.as_deref(), Some("core_sync=trace"));
        assert!(!config.display_target);
        assert_eq!(config.output, LogOutput::Stdout);
    }

    #[test]
    fn test_config_from_json() {
        let config: LoggingConfig =
            serde_json::from_str(r#"{"level": "warn", "format": "compact"}"#).unwrap();

        assert_eq!(config.level, LogLevel::Warn);
        assert_eq!(config.format, LogFormat::Compact);
        assert_eq!(config.output, LogOutput::Stderr);
    }

    #[test]
    fn test_redaction() {
        assert_eq!(redact_if_sensitive("access_token", "ya29.secret"), "[REDACTED]");
        assert_eq!(redact_if_sensitive("Password", "hunter2"), "[REDACTED]");
        assert_eq!(
            redact_if_sensitive("account", "alice@example.com"),
            "a***@[REDACTED]"
        );
        assert_eq!(
            redact_if_sensitive("source", "gmail:alice@example.com"),
            "gmail:a***@[REDACTED]"
        );
        assert_eq!(redact_if_sensitive("source", "imap:test"), "imap:test");
        // Message-IDs look like addresses but have no dotted domain part here
        assert_eq!(redact_if_sensitive("message_id", "abc@local"), "abc@local");
        assert_eq!(redact_if_sensitive("folder", "INBOX"), "INBOX");
    }

    #[test]
    fn test_strip_path() {
        assert_eq!(
            strip_path("/archive/accounts/a/2024/01/20240101_000000_abc.eml"),
            "20240101_000000_abc.eml"
        );
        assert_eq!(strip_path("C:\\archive\\x.eml"), "x.eml");
        assert_eq!(strip_path("x.eml"), "x.eml");
    }

    #[test]
    fn test_default_filter() {
        let filter = default_filter(LogLevel::Debug);

        assert!(filter.starts_with("core_runtime=debug,"));
        assert!(filter.contains("provider_imap=debug"));
        assert!(filter.ends_with("sqlx=warn"));
        assert!(build_filter(&LoggingConfig::default()).is_ok());
    }

    #[test]
    fn test_custom_filter_replaces_default() {
        let config = LoggingConfig::default().with_filter("core_auth=trace,core_sync=debug");
        let filter = build_filter(&config).unwrap().to_string();

        assert!(filter.contains("core_auth=trace"));
        assert!(!filter.contains("sqlx"));
    }
}

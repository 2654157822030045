//! Integration tests for logging system

use core_runtime::logging::{
    init_logging, redact_if_sensitive, strip_path, LogFormat, LogLevel, LoggingConfig,
};

#[test]
fn test_pii_redaction_tokens() {
    assert_eq!(
        redact_if_sensitive("access_token", "ya29.a0Af"),
        "[REDACTED]"
    );
    assert_eq!(
        redact_if_sensitive("refresh_token", "1//0g-refresh"),
        "[REDACTED]"
    );
    assert_eq!(redact_if_sensitive("imap_password", "app-pass"), "[REDACTED]");
}

#[test]
fn test_pii_redaction_accounts() {
    let redacted = redact_if_sensitive("account", "user@example.com");

    assert!(redacted.starts_with('u'));
    assert!(redacted.contains("[REDACTED]"));
    assert!(!redacted.contains("example.com"));
}

#[test]
fn test_pii_redaction_normal_values() {
    assert_eq!(redact_if_sensitive("folder", "[Gmail]/All Mail"), "[Gmail]/All Mail");
    assert_eq!(redact_if_sensitive("message_id", "INBOX:42"), "INBOX:42");
}

#[test]
fn test_path_stripping() {
    assert_eq!(
        strip_path("accounts/alice/2024/05/20240501_101500_0123456789ab.eml"),
        "20240501_101500_0123456789ab.eml"
    );
    assert_eq!(strip_path("D:\\mail\\archive.db"), "archive.db");
    assert_eq!(strip_path("/var/mail/"), "");
    assert_eq!(strip_path(""), "");
}

#[test]
fn test_init_logging_only_once() {
    let config = LoggingConfig::default()
        .with_format(LogFormat::Compact)
        .with_level(LogLevel::Warn);

    let first = init_logging(config.clone());
    let second = init_logging(config);

    assert!(first.is_ok());
    assert!(second.is_err());
}

#[test]
fn test_invalid_filter_is_rejected() {
    let config = LoggingConfig::default().with_filter("core_sync=verbose");
    assert!(init_logging(config).is_err());
}

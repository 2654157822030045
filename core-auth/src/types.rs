use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Seconds before expiry at which an OAuth token is treated as expired.
pub const EXPIRY_BUFFER_SECONDS: i64 = 300;

/// Secret material for one credential.
///
/// # Security
///
/// Secrets are never logged. The `Debug` implementation on [`Credential`]
/// redacts them.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CredentialKind {
    /// OAuth 2.0 bearer token, used by REST sources.
    OAuth {
        access_token: String,
        refresh_token: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    },
    /// Username and (app) password, used by IMAP sources.
    Password { username: String, password: String },
}

/// A credential for one mail source.
///
/// The core only inspects validity and expiry; everything else is handed
/// verbatim to the adapter that owns the source.
///
/// # Examples
///
/// ```
/// use core_auth::Credential;
/// use chrono::{Duration, Utc};
///
/// let credential = Credential::oauth(
///     "gmail:alice@example.com",
///     "ya29.a0...",
///     Some("1//0g...".to_string()),
///     Some(Utc::now() + Duration::hours(1)),
/// );
///
/// assert!(credential.is_valid());
/// ```
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Source this credential belongs to
    pub source: String,
    #[serde(flatten)]
    pub kind: CredentialKind,
}

impl Credential {
    pub fn oauth(
        source: impl Into<String>,
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            source: source.into(),
            kind: CredentialKind::OAuth {
                access_token: access_token.into(),
                refresh_token,
                expires_at,
            },
        }
    }

    pub fn password(
        source: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            kind: CredentialKind::Password {
                username: username.into(),
                password: password.into(),
            },
        }
    }

    /// Access token for OAuth credentials.
    pub fn access_token(&self) -> Option<&str> {
        match &self.kind {
            CredentialKind::OAuth { access_token, .. } => Some(access_token),
            CredentialKind::Password { .. } => None,
        }
    }

    pub fn refresh_token(&self) -> Option<&str> {
        match &self.kind {
            CredentialKind::OAuth { refresh_token, .. } => refresh_token.as_deref(),
            CredentialKind::Password { .. } => None,
        }
    }

    /// Whether the credential can be refreshed without user interaction.
    pub fn can_refresh(&self) -> bool {
        self.refresh_token().is_some()
    }

    /// Check if the credential is expired or will expire within the
    /// default buffer.
    ///
    /// Passwords and tokens without an expiry never expire.
    pub fn is_expired(&self) -> bool {
        self.is_expired_with_buffer(EXPIRY_BUFFER_SECONDS)
    }

    pub fn is_expired_with_buffer(&self, buffer_seconds: i64) -> bool {
        match &self.kind {
            CredentialKind::OAuth {
                expires_at: Some(expires_at),
                ..
            } => Utc::now() >= *expires_at - Duration::seconds(buffer_seconds),
            _ => false,
        }
    }

    /// Whether the credential can be used as-is.
    pub fn is_valid(&self) -> bool {
        let has_secret = match &self.kind {
            CredentialKind::OAuth { access_token, .. } => !access_token.is_empty(),
            CredentialKind::Password { username, password } => {
                !username.is_empty() && !password.is_empty()
            }
        };
        has_secret && !self.is_expired()
    }
}

// Custom Debug implementation to avoid logging secrets
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Credential");
        debug.field("source", &self.source);
        match &self.kind {
            CredentialKind::OAuth {
                refresh_token,
                expires_at,
                ..
            } => debug
                .field("kind", &"oauth")
                .field("access_token", &"[REDACTED]")
                .field("has_refresh_token", &refresh_token.is_some())
                .field("expires_at", expires_at),
            CredentialKind::Password { username, .. } => debug
                .field("kind", &"password")
                .field("username", username)
                .field("password", &"[REDACTED]"),
        };
        debug.finish()
    }
}

//! Gmail API response types
//!
//! Data structures for deserializing Gmail API v1 responses. Only the
//! fields the archive reads are modelled.

use serde::Deserialize;

/// `users.getProfile`
///
/// See: https://developers.google.com/gmail/api/reference/rest/v1/users/getProfile
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub email_address: String,
    #[serde(default)]
    pub messages_total: u64,
    pub history_id: String,
}

/// Message reference as returned by list endpoints.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    pub id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
}

/// `users.messages.list`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesListResponse {
    #[serde(default)]
    pub messages: Vec<MessageRef>,
    pub next_page_token: Option<String>,
    #[serde(default)]
    pub result_size_estimate: u64,
}

/// `users.messages.get` with `format=raw`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    pub id: String,
    #[serde(default)]
    pub label_ids: Vec<String>,
    /// base64url-encoded RFC 5322 bytes
    pub raw: String,
}

/// `users.messages.get` with `format=minimal`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageLabels {
    pub id: String,
    #[serde(default)]
    pub label_ids: Vec<String>,
}

/// `users.history.list`
///
/// See: https://developers.google.com/gmail/api/reference/rest/v1/users.history/list
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryListResponse {
    #[serde(default)]
    pub history: Vec<HistoryRecord>,
    pub next_page_token: Option<String>,
    pub history_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub id: String,
    #[serde(default)]
    pub messages_added: Vec<MessageAdded>,
}

#[derive(Debug, Deserialize)]
pub struct MessageAdded {
    pub message: MessageRef,
}

/// `users.labels.list`
#[derive(Debug, Deserialize)]
pub struct LabelsListResponse {
    #[serde(default)]
    pub labels: Vec<Label>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Label {
    pub id: String,
    pub name: String,
}

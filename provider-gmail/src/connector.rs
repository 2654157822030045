//! Gmail API connector implementation
//!
//! Implements the `SourceAdapter` contract for the Gmail REST API v1: a
//! change-feed source whose cursor is the mailbox `historyId`.

use async_trait::async_trait;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use bridge_traits::http::{HttpClient, HttpRequest, HttpResponse};
use bridge_traits::RetryPolicy;
use core_runtime::config::SyncOptions;
use core_runtime::logging::redact_if_sensitive;
use core_sync::{
    BatchFetch, DateRange, FetchedMessage, IncrementalPlan, LabelFetch, SourceAdapter, SyncCursor,
    SyncError, GMAIL_LABEL_HEADER,
};
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{GmailError, Result};
use crate::types::{
    HistoryListResponse, LabelsListResponse, MessageLabels, MessagesListResponse, Profile,
    RawMessage,
};

/// Gmail API base URL for the authenticated user
const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

/// Maximum results per page (Gmail API limit)
const MAX_PAGE_SIZE: u32 = 500;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Gmail pads `raw` inconsistently.
const BASE64_URL_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Gmail mailbox as a change-feed source.
///
/// One instance serves one sync run: the label-name cache it fills is
/// dropped with it.
///
/// # Example
///
/// ```ignore
/// use provider_gmail::GmailSource;
///
/// let source = GmailSource::new(http_client, "alice@example.com", token, &options);
/// let summary = coordinator.sync(&source, &DateRange::default(), &ctx).await?;
/// ```
pub struct GmailSource {
    http_client: Arc<dyn HttpClient>,
    access_token: String,
    source_name: String,
    include_labels: bool,
    max_concurrent_fetches: usize,
    retry: RetryPolicy,
    /// label id -> display name
    label_cache: OnceCell<HashMap<String, String>>,
    /// Cuts rate-limit backoff short once the run is asked to stop
    stop: CancellationToken,
}

impl GmailSource {
    /// Create a source for `account`
    ///
    /// # Arguments
    ///
    /// * `http_client` - HTTP client implementation
    /// * `account` - mailbox address, used to name the source
    /// * `access_token` - OAuth 2.0 access token with `gmail.readonly` scope
    /// * `options` - label and concurrency settings
    pub fn new(
        http_client: Arc<dyn HttpClient>,
        account: &str,
        access_token: impl Into<String>,
        options: &SyncOptions,
    ) -> Self {
        Self {
            http_client,
            access_token: access_token.into(),
            source_name: Self::source_name_for(account),
            include_labels: options.include_labels,
            max_concurrent_fetches: options.max_concurrent_fetches.max(1),
            retry: options.retry_policy(),
            label_cache: OnceCell::new(),
            stop: CancellationToken::new(),
        }
    }

    /// Abandon rate-limit backoff when `stop` is cancelled, usually
    /// [`RunContext::stop_token`](core_sync::RunContext::stop_token).
    pub fn with_stop_signal(mut self, stop: CancellationToken) -> Self {
        self.stop = stop;
        self
    }

    pub fn source_name_for(account: &str) -> String {
        format!("gmail:{}", account)
    }

    /// Execute a GET and classify non-2xx statuses.
    async fn get(&self, url: String) -> Result<HttpResponse> {
        let request = HttpRequest::get(url)
            .bearer_token(&self.access_token)
            .header("Accept", "application/json")
            .timeout(REQUEST_TIMEOUT);

        let response = self.http_client.execute(request).await?;

        if response.is_success() {
            return Ok(response);
        }

        let status = response.status;
        debug!(status = status, "Gmail API request failed");

        if response.is_rate_limited() {
            Err(GmailError::RateLimitExceeded {
                status_code: status,
            })
        } else if status == 401 {
            Err(GmailError::AuthenticationFailed(
                response.body_text().into_owned(),
            ))
        } else if response.is_server_error() {
            Err(GmailError::ServerError {
                status_code: status,
            })
        } else {
            Err(GmailError::ApiError {
                status_code: status,
                message: response.body_text().into_owned(),
            })
        }
    }

    fn parse<T: serde::de::DeserializeOwned>(response: &HttpResponse, what: &str) -> Result<T> {
        serde_json::from_slice(&response.body)
            .map_err(|e| GmailError::ParseError(format!("Failed to parse {}: {}", what, e)))
    }

    /// `users.getProfile`
    pub async fn profile(&self) -> Result<Profile> {
        let response = self.get(format!("{}/profile", GMAIL_API_BASE)).await?;
        Self::parse(&response, "profile")
    }

    /// Gmail search terms for a date range. Gmail's `before:` is exclusive,
    /// matching `DateRange::until`.
    fn date_query(range: &DateRange) -> Option<String> {
        let mut parts = Vec::new();
        if let Some(since) = range.since {
            parts.push(format!("after:{}", since.format("%Y/%m/%d")));
        }
        if let Some(until) = range.until {
            parts.push(format!("before:{}", until.format("%Y/%m/%d")));
        }
        (!parts.is_empty()).then(|| parts.join(" "))
    }

    async fn list_message_ids(&self, query: Option<&str>) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = format!("{}/messages?maxResults={}", GMAIL_API_BASE, MAX_PAGE_SIZE);
            if let Some(query) = query {
                url.push_str(&format!("&q={}", urlencoding::encode(query)));
            }
            if let Some(token) = &page_token {
                url.push_str(&format!("&pageToken={}", urlencoding::encode(token)));
            }

            let response = self.get(url).await?;
            let page: MessagesListResponse = Self::parse(&response, "messages list")?;
            ids.extend(page.messages.into_iter().map(|m| m.id));
            debug!(found = ids.len(), "Listed message page");

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(ids)
    }

    /// Messages added since `history_id`, in history order.
    async fn messages_added_since(&self, history_id: &str) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut seen = HashSet::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = format!(
                "{}/history?startHistoryId={}&historyTypes=messageAdded&maxResults={}",
                GMAIL_API_BASE,
                urlencoding::encode(history_id),
                MAX_PAGE_SIZE
            );
            if let Some(token) = &page_token {
                url.push_str(&format!("&pageToken={}", urlencoding::encode(token)));
            }

            let response = match self.get(url).await {
                Err(GmailError::ApiError {
                    status_code: 404, ..
                }) => {
                    return Err(GmailError::HistoryExpired {
                        history_id: history_id.to_string(),
                    })
                }
                other => other?,
            };
            let page: HistoryListResponse = Self::parse(&response, "history list")?;

            for record in page.history {
                for added in record.messages_added {
                    if seen.insert(added.message.id.clone()) {
                        ids.push(added.message.id);
                    }
                }
            }

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(ids)
    }

    /// Label names, loaded once per instance. A failed lookup leaves the
    /// cache empty so labels fall back to their raw ids.
    async fn label_names(&self) -> &HashMap<String, String> {
        self.label_cache
            .get_or_init(|| async {
                let loaded = async {
                    let response = self.get(format!("{}/labels", GMAIL_API_BASE)).await?;
                    Self::parse::<LabelsListResponse>(&response, "labels list")
                }
                .await;

                match loaded {
                    Ok(list) => {
                        debug!(labels = list.labels.len(), "Loaded label names");
                        list.labels.into_iter().map(|l| (l.id, l.name)).collect()
                    }
                    Err(e) => {
                        warn!(error = %e, "Could not load label names, using label ids");
                        HashMap::new()
                    }
                }
            })
            .await
    }

    async fn resolve_labels(&self, label_ids: &[String]) -> Vec<String> {
        let names = self.label_names().await;
        label_ids
            .iter()
            .map(|id| names.get(id).cloned().unwrap_or_else(|| id.clone()))
            .collect()
    }

    async fn get_raw(&self, id: &str) -> Result<FetchedMessage> {
        let url = format!(
            "{}/messages/{}?format=raw",
            GMAIL_API_BASE,
            urlencoding::encode(id)
        );

        let response = match self.get(url).await {
            Err(GmailError::ApiError {
                status_code: 404, ..
            }) => {
                return Err(GmailError::MessageNotFound {
                    message_id: id.to_string(),
                })
            }
            other => other?,
        };
        let message: RawMessage = Self::parse(&response, "raw message")?;

        let raw = BASE64_URL_LENIENT
            .decode(message.raw.trim())
            .map_err(|e| GmailError::ParseError(format!("Invalid raw payload for {}: {}", id, e)))?;

        let labels = if self.include_labels {
            self.resolve_labels(&message.label_ids).await
        } else {
            Vec::new()
        };

        Ok(FetchedMessage::new(raw, labels))
    }

    /// Label names of one message, without its body.
    async fn get_labels(&self, id: &str) -> Result<Vec<String>> {
        let url = format!(
            "{}/messages/{}?format=minimal",
            GMAIL_API_BASE,
            urlencoding::encode(id)
        );

        let response = match self.get(url).await {
            Err(GmailError::ApiError {
                status_code: 404, ..
            }) => {
                return Err(GmailError::MessageNotFound {
                    message_id: id.to_string(),
                })
            }
            other => other?,
        };
        let message: MessageLabels = Self::parse(&response, "message labels")?;

        Ok(self.resolve_labels(&message.label_ids).await)
    }

    /// Run `fetch` for every id, at most `max_concurrent_fetches` at a time.
    ///
    /// Rate-limited items are retried as a subset with backoff; when every
    /// item of the first round is rate limited the whole call is reported
    /// as rate limited instead. A stop request during backoff ends the call
    /// with [`SyncError::Cancelled`].
    async fn fetch_all<T, F, Fut>(
        &self,
        ids: &[String],
        fetch: F,
    ) -> core_sync::Result<HashMap<String, core_sync::Result<T>>>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = (String, Result<T>)>,
    {
        let mut results = HashMap::with_capacity(ids.len());
        let mut pending: Vec<String> = ids.to_vec();
        let mut attempt = 1;

        loop {
            let round: Vec<(String, Result<T>)> = stream::iter(pending)
                .map(&fetch)
                .buffer_unordered(self.max_concurrent_fetches)
                .collect()
                .await;

            let mut limited = Vec::new();
            for (id, result) in round {
                match result {
                    Err(GmailError::RateLimitExceeded { .. }) => limited.push(id),
                    other => {
                        results.insert(id, other.map_err(|e| self.sync_error(e)));
                    }
                }
            }

            if limited.is_empty() {
                break;
            }

            if results.is_empty() {
                return Err(SyncError::RateLimited(format!(
                    "all {} messages in batch rate limited",
                    limited.len()
                )));
            }

            if !self.retry.should_retry(attempt) {
                warn!(items = limited.len(), "Rate limit retries exhausted");
                for id in limited {
                    let error = GmailError::RateLimitExceeded { status_code: 429 };
                    results.insert(id, Err(self.sync_error(error)));
                }
                break;
            }

            let delay = self.retry.delay_for_attempt(attempt);
            warn!(
                items = limited.len(),
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                "Retrying rate-limited messages"
            );
            tokio::select! {
                _ = self.stop.cancelled() => {
                    info!(items = limited.len(), "Stop requested during rate-limit backoff");
                    return Err(SyncError::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }
            pending = limited;
            attempt += 1;
        }

        Ok(results)
    }

    fn sync_error(&self, error: GmailError) -> SyncError {
        error.into_sync_error(&self.source_name)
    }
}

#[async_trait]
impl SourceAdapter for GmailSource {
    fn source_name(&self) -> &str {
        &self.source_name
    }

    fn label_header(&self) -> &'static str {
        GMAIL_LABEL_HEADER
    }

    #[instrument(skip(self), fields(source = %redact_if_sensitive("source", &self.source_name)))]
    async fn enumerate_all(&self, range: &DateRange) -> core_sync::Result<Vec<String>> {
        let query = Self::date_query(range);
        let ids = self
            .list_message_ids(query.as_deref())
            .await
            .map_err(|e| self.sync_error(e))?;

        info!(messages = ids.len(), query = ?query, "Enumerated Gmail messages");
        Ok(ids)
    }

    #[instrument(skip(self, cursor), fields(source = %redact_if_sensitive("source", &self.source_name)))]
    async fn plan_incremental(&self, cursor: &SyncCursor) -> core_sync::Result<IncrementalPlan> {
        let SyncCursor::ChangeFeed { history_id } = cursor else {
            warn!("Stored cursor is not a change-feed cursor");
            return Ok(IncrementalPlan {
                candidates: Vec::new(),
                new_cursor: None,
            });
        };

        // Snapshot first: anything added while paging is seen again next run.
        let snapshot = self.profile().await.map_err(|e| self.sync_error(e))?;
        let candidates = self
            .messages_added_since(history_id)
            .await
            .map_err(|e| self.sync_error(e))?;

        info!(
            since = %history_id,
            added = candidates.len(),
            "Planned incremental Gmail sync"
        );
        Ok(IncrementalPlan {
            candidates,
            new_cursor: Some(SyncCursor::change_feed(snapshot.history_id)),
        })
    }

    async fn fetch_one(&self, id: &str) -> core_sync::Result<FetchedMessage> {
        self.get_raw(id).await.map_err(|e| self.sync_error(e))
    }

    /// Concurrent `format=raw` GETs, bounded by `max_concurrent_fetches`,
    /// with rate-limited items retried as a subset.
    #[instrument(skip(self, ids), fields(source = %redact_if_sensitive("source", &self.source_name), batch = ids.len()))]
    async fn fetch_batch(&self, ids: &[String]) -> core_sync::Result<BatchFetch> {
        self.fetch_all(ids, |id| async move {
            let result = self.get_raw(&id).await;
            (id, result)
        })
        .await
    }

    /// `format=minimal` GETs: label ids only, resolved to names.
    #[instrument(skip(self, ids), fields(source = %redact_if_sensitive("source", &self.source_name), batch = ids.len()))]
    async fn fetch_labels(&self, ids: &[String]) -> core_sync::Result<LabelFetch> {
        if !self.include_labels {
            return Ok(LabelFetch::new());
        }

        self.fetch_all(ids, |id| async move {
            let result = self.get_labels(&id).await;
            (id, result)
        })
        .await
    }

    async fn current_cursor(&self) -> core_sync::Result<SyncCursor> {
        let profile = self.profile().await.map_err(|e| self.sync_error(e))?;
        Ok(SyncCursor::change_feed(profile.history_id))
    }
}

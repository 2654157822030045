//! `HttpClient` over reqwest (rustls).

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    http::{HttpClient, HttpRequest, HttpResponse},
};
use reqwest::Client;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Whole-request deadline when the request sets none
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Pooled client shared by every REST source of a host.
///
/// Throttling and retries are the adapter's business; this type only moves
/// bytes and reports transport failures.
#[derive(Clone)]
pub struct ReqwestHttpClient {
    client: Client,
}

impl ReqwestHttpClient {
    pub fn new() -> Result<Self> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("mailvault/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BridgeError::Unavailable(format!("HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    fn prepare(&self, request: HttpRequest) -> reqwest::RequestBuilder {
        let builder = request
            .headers
            .into_iter()
            .fold(self.client.get(&request.url), |builder, (name, value)| {
                builder.header(name, value)
            });

        match request.timeout {
            Some(timeout) => builder.timeout(timeout),
            None => builder,
        }
    }
}

/// Timeouts and refused connections are worth retrying, anything else is not.
fn classify(error: reqwest::Error) -> BridgeError {
    if error.is_timeout() {
        BridgeError::Timeout(error.to_string())
    } else if error.is_connect() {
        BridgeError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            error.to_string(),
        ))
    } else {
        BridgeError::Request(error.to_string())
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        debug!(url = %request.url, "GET");

        let response = self.prepare(request).send().await.map_err(|e| {
            warn!(error = %e, "HTTP request failed");
            classify(e)
        })?;

        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| Some((name.to_string(), value.to_str().ok()?.to_string())))
            .collect();
        let body = response.bytes().await.map_err(classify)?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

//! HTTP Fetcher
//!
//! Default [`Fetcher`] backed by a shared `reqwest` client:
//! - gzip/brotli decoding, rustls TLS
//! - Connection timeout on the client, whole-request timeout per call
//! - Bodies larger than `max_body_bytes` are refused
//! - Response classification into transient or permanent failures
//!
//! Retries are not done here; the fetch executor owns the retry loop.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

use super::Fetcher;
use crate::error::{FetchError, IngestionError, Result};

/// Configuration for the HTTP fetcher
#[derive(Debug, Clone)]
pub struct HttpFetcherConfig {
    /// Connection timeout
    pub connect_timeout: Duration,
    /// User agent string
    pub user_agent: String,
    /// Largest response body accepted
    pub max_body_bytes: usize,
}

impl Default for HttpFetcherConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            user_agent: format!("content-ingestion/{}", env!("CARGO_PKG_VERSION")),
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

pub struct HttpFetcher {
    client: Client,
    max_body_bytes: usize,
}

impl HttpFetcher {
    pub fn new(config: HttpFetcherConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(&config.user_agent)
            .gzip(true)
            .brotli(true)
            .build()
            .map_err(IngestionError::HttpError)?;

        Ok(Self {
            client,
            max_body_bytes: config.max_body_bytes,
        })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(HttpFetcherConfig::default())
    }

    /// Statuses worth another attempt: 408, 429 and all 5xx.
    pub fn is_retryable_status(status: StatusCode) -> bool {
        status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
            || status.is_server_error()
    }

    fn classify_status(status: StatusCode) -> FetchError {
        let message = format!("HTTP {}", status.as_u16());
        if Self::is_retryable_status(status) {
            FetchError::Transient(message)
        } else {
            FetchError::Permanent(message)
        }
    }

    fn too_large(&self) -> FetchError {
        FetchError::Permanent(format!("response body exceeds {} bytes", self.max_body_bytes))
    }

    fn classify_error(err: reqwest::Error) -> FetchError {
        if err.is_builder() || err.is_redirect() {
            FetchError::Permanent(err.to_string())
        } else if err.is_timeout() {
            FetchError::Transient("timeout".to_string())
        } else {
            // connect, request and body errors
            FetchError::Transient(err.to_string())
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, timeout: Duration) -> std::result::Result<Vec<u8>, FetchError> {
        let parsed = url::Url::parse(url)
            .map_err(|e| FetchError::permanent(format!("invalid url: {e}")))?;

        debug!(url = %parsed, "Fetching");

        let mut response = self
            .client
            .get(parsed)
            .timeout(timeout)
            .send()
            .await
            .map_err(Self::classify_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::classify_status(status));
        }

        if response
            .content_length()
            .is_some_and(|len| len > self.max_body_bytes as u64)
        {
            return Err(self.too_large());
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(Self::classify_error)? {
            if body.len() + chunk.len() > self.max_body_bytes {
                return Err(self.too_large());
            }
            body.extend_from_slice(&chunk);
        }

        debug!(url = %url, status = %status, bytes = body.len(), "Fetched");
        Ok(body)
    }
}

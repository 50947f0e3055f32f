//! Fetcher for the NDW bridge opening feed (DATEX II, gzip compressed).
//!
//! One GET per call, no retries: a failed fetch is retried by the next
//! scheduled run.

use chrono::{DateTime, Utc};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct FeedClient {
    client: reqwest::Client,
}

/// Raw feed document as downloaded
#[derive(Debug, Clone)]
pub struct FeedPayload {
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

impl FeedClient {
    pub fn new() -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| FetchError::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    /// Download the current feed document
    pub async fn fetch(&self, url: &str, timeout: Duration) -> Result<FeedPayload, FetchError> {
        tracing::debug!(url = %url, timeout_secs = timeout.as_secs(), "Fetching opening feed");

        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(FetchError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            tracing::error!(status = %status, url = %url, "Opening feed returned an error status");
            return Err(FetchError::Status(status.as_u16()));
        }

        let body = response
            .bytes()
            .await
            .map_err(FetchError::from_reqwest)?
            .to_vec();

        tracing::info!(bytes = body.len(), "Fetched opening feed");

        Ok(FeedPayload {
            body,
            fetched_at: Utc::now(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Request timed out")]
    Timeout,
    #[error("HTTP {0}")]
    Status(u16),
}

impl FetchError {
    pub fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else if let Some(status) = e.status() {
            FetchError::Status(status.as_u16())
        } else {
            FetchError::Network(e.to_string())
        }
    }
}

//! Upstream image download
//!
//! - http/https only
//! - whole-request timeout
//! - response size cap, enforced while streaming

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::{Client, Url};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Default upstream timeout (30s)
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Default maximum response size (50MB)
pub const DEFAULT_MAX_SIZE: u64 = 50 * 1024 * 1024;

/// Failure to produce image bytes
///
/// `Clone` because one outcome is handed to every caller waiting on the
/// same in-flight key.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Upstream returned status {0}")]
    Status(u16),

    #[error("Upstream request timed out")]
    Timeout,

    #[error("Response too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },

    #[error("Image decode failed: {0}")]
    Decode(String),

    #[error("Image encode failed: {0}")]
    Encode(String),

    #[error("Fetch aborted: {0}")]
    Aborted(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Http(e.to_string())
        }
    }
}

/// Where raw image bytes come from
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError>;
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout: Duration,
    pub max_size: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_FETCH_TIMEOUT,
            max_size: DEFAULT_MAX_SIZE,
        }
    }
}

/// [`ImageSource`] over HTTP
#[derive(Debug, Clone)]
pub struct HttpImageSource {
    client: Client,
    config: FetchConfig,
}

impl HttpImageSource {
    pub fn new(config: FetchConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("urlpool/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Http(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }
}

fn parse_http_url(url: &str) -> Result<Url, FetchError> {
    let parsed = Url::parse(url).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(FetchError::InvalidUrl(format!(
            "unsupported scheme '{}'",
            other
        ))),
    }
}

#[async_trait]
impl ImageSource for HttpImageSource {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        let parsed = parse_http_url(url)?;
        let max = self.config.max_size;

        let mut response = self.client.get(parsed).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        if let Some(size) = response.content_length() {
            if size > max {
                return Err(FetchError::TooLarge { size, max });
            }
        }

        let mut body = BytesMut::new();
        while let Some(chunk) = response.chunk().await? {
            let size = (body.len() + chunk.len()) as u64;
            if size > max {
                return Err(FetchError::TooLarge { size, max });
            }
            body.extend_from_slice(&chunk);
        }

        debug!(url = %url, bytes = body.len(), "Fetched upstream image");
        Ok(body.freeze())
    }
}

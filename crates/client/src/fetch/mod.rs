//! Network tier: turns an image identifier into raw bytes.
//!
//! ### Limits
//! - Connect timeout and per-read timeout (default: 5s each)
//! - Max redirects: 5
//! - Max body bytes: 10MB (configurable), enforced while streaming
//!
//! Non-2xx statuses are failures. Nothing is retried here; a failed fetch is
//! reported once and the caller decides whether to look up again.

pub mod url;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::{Client, header};

pub use url::{UrlError, canonicalize};

use pixcache_core::{AppConfig, Error};

/// Source of raw image bytes.
///
/// Implementations must be safe to call from many workers at once.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, identifier: &str) -> Result<Bytes, Error>;
}

/// Configuration for [`HttpFetcher`].
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// User agent string (default: "pixcache/0.1")
    pub user_agent: String,

    /// Maximum response body size in bytes (default: 10MB)
    pub max_bytes: usize,

    /// TCP/TLS connect timeout (default: 5s)
    pub connect_timeout: Duration,

    /// Timeout for each read of the response (default: 5s)
    pub read_timeout: Duration,

    /// Maximum number of redirects to follow (default: 5)
    pub max_redirects: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: "pixcache/0.1".to_string(),
            max_bytes: 10 * 1024 * 1024,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            max_redirects: 5,
        }
    }
}

impl From<&AppConfig> for FetchConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            max_bytes: config.max_fetch_bytes,
            connect_timeout: config.connect_timeout(),
            read_timeout: config.read_timeout(),
            ..Self::default()
        }
    }
}

/// HTTP(S) fetcher on a shared `reqwest` client.
pub struct HttpFetcher {
    http: Client,
    config: FetchConfig,
}

impl HttpFetcher {
    pub fn new(config: FetchConfig) -> Result<Self, Error> {
        let http = Client::builder()
            .user_agent(&config.user_agent)
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .use_rustls_tls()
            .build()
            .map_err(|e| Error::InvalidConfig(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { http, config })
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    fn too_large(&self, len: u64) -> Error {
        Error::FetchTooLarge(format!("{len} bytes exceeds {}", self.config.max_bytes))
    }
}

fn transport_error(e: reqwest::Error) -> Error {
    if e.is_timeout() { Error::FetchTimeout(e.to_string()) } else { Error::HttpError(format!("network error: {e}")) }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, identifier: &str) -> Result<Bytes, Error> {
        let start = Instant::now();
        let url = canonicalize(identifier).map_err(|e| Error::InvalidUrl(e.to_string()))?;

        let mut response = self
            .http
            .get(url.as_str())
            .header(header::ACCEPT, "image/avif,image/webp,image/png,image/jpeg,image/*;q=0.8,*/*;q=0.5")
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::HttpError(format!("status {}", status.as_u16())));
        }

        let limit = self.config.max_bytes as u64;
        if let Some(len) = response.content_length()
            && len > limit
        {
            return Err(self.too_large(len));
        }

        let mut body = BytesMut::with_capacity(response.content_length().unwrap_or(0) as usize);
        while let Some(chunk) = response.chunk().await.map_err(transport_error)? {
            if (body.len() + chunk.len()) as u64 > limit {
                return Err(self.too_large((body.len() + chunk.len()) as u64));
            }
            body.extend_from_slice(&chunk);
        }

        tracing::debug!(url = %url, bytes = body.len(), fetch_ms = start.elapsed().as_millis() as u64, "fetched");
        Ok(body.freeze())
    }
}

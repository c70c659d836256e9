//! Fetching from the upstream endpoints.

use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header;

/// The User-Agent sent with every upstream request.
pub const USER_AGENT: &str = concat!("stampede/", env!("CARGO_PKG_VERSION"));

/// A failed upstream fetch.
///
/// The [`Display`](fmt::Display) output of this error is what gets cached as the body of an
/// error result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    /// The upstream did not respond in time.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// Connecting to or talking to the upstream failed.
    #[error("request failed: {0}")]
    Transport(String),
    /// The response body could not be read as text.
    #[error("invalid response body: {0}")]
    InvalidBody(String),
}

impl UpstreamError {
    fn metrics_tag(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Transport(_) => "transport",
            Self::InvalidBody(_) => "body",
        }
    }
}

/// Something that resolves a URL to a response body.
#[async_trait]
pub trait Upstream: fmt::Debug + Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, UpstreamError>;
}

/// Creates a [`reqwest::Client`] for upstream fetches.
///
/// `timeout` bounds the whole request, from connecting until the body was read.
pub fn create_client(timeout: Duration) -> reqwest::Client {
    reqwest::ClientBuilder::new()
        .gzip(true)
        .connect_timeout(timeout)
        .timeout(timeout)
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_else(|err| {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "Failed to configure HTTP client, falling back to defaults"
            );
            reqwest::Client::new()
        })
}

/// An [`Upstream`] talking HTTP.
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpUpstream {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: create_client(timeout),
            timeout,
        }
    }

    async fn fetch_inner(&self, url: &str) -> Result<String, UpstreamError> {
        let response = self
            .client
            .get(url)
            .header(header::USER_AGENT, USER_AGENT)
            .send()
            .await
            .map_err(|err| self.map_reqwest_error(err))?;

        // whatever the upstream answered is its response, error statuses included
        let status = response.status();
        if !status.is_success() {
            tracing::debug!(url, status = status.as_u16(), "Upstream responded with error status");
        }

        response.text().await.map_err(|err| {
            if err.is_timeout() {
                UpstreamError::Timeout(self.timeout)
            } else {
                UpstreamError::InvalidBody(err.to_string())
            }
        })
    }

    fn map_reqwest_error(&self, err: reqwest::Error) -> UpstreamError {
        if err.is_timeout() {
            UpstreamError::Timeout(self.timeout)
        } else {
            UpstreamError::Transport(err.to_string())
        }
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn fetch(&self, url: &str) -> Result<String, UpstreamError> {
        let start = Instant::now();
        // The client enforces the timeout already, this also covers resolving and redirects.
        let result = match tokio::time::timeout(self.timeout, self.fetch_inner(url)).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::Timeout(self.timeout)),
        };

        metric!(timer("upstream.fetch.duration") = start.elapsed());
        match &result {
            Ok(_) => metric!(counter("upstream.fetch") += 1, "status" => "ok"),
            Err(err) => {
                metric!(counter("upstream.fetch") += 1, "status" => err.metrics_tag());
                tracing::debug!(
                    error = err as &dyn std::error::Error,
                    url,
                    "Upstream fetch failed"
                );
            }
        }

        result
    }
}

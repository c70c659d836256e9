use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::store::{StoreError, StoreRef};

/// Errors reading or writing cached results.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("result cache unavailable")]
    Store(#[from] StoreError),
    /// The stored record could not be parsed.
    #[error("malformed cache record")]
    Malformed(#[from] serde_json::Error),
}

/// The cached outcome of one upstream fetch.
///
/// Failures are cached just like successes. For those, `body` holds a description of the
/// failure instead of content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResult {
    #[serde(rename = "response")]
    pub body: String,
    #[serde(default)]
    pub is_error: bool,
}

impl CachedResult {
    pub fn success(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            is_error: false,
        }
    }

    pub fn error(description: impl Into<String>) -> Self {
        Self {
            body: description.into(),
            is_error: true,
        }
    }

    /// The body to hand to a caller, if this is not a failure.
    pub fn into_body(self) -> Option<String> {
        (!self.is_error).then_some(self.body)
    }
}

/// An inclusive range of whole seconds to draw cache lifetimes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlRange {
    min: u64,
    max: u64,
}

impl TtlRange {
    /// Creates a new range, swapping the bounds if they are given in the wrong order.
    pub fn new(min: u64, max: u64) -> Self {
        Self {
            min: min.min(max),
            max: min.max(max),
        }
    }

    pub fn min(&self) -> Duration {
        Duration::from_secs(self.min)
    }

    pub fn max(&self) -> Duration {
        Duration::from_secs(self.max)
    }

    /// Draws a lifetime uniformly from the range.
    ///
    /// Entries written at the same moment thus expire at different times, instead of all
    /// missing at once and stampeding the upstream again.
    pub fn sample(&self) -> Duration {
        let secs = rand::thread_rng().gen_range(self.min..=self.max);
        Duration::from_secs(secs)
    }
}

/// Cached fetch results, keyed by URL.
#[derive(Clone, Debug)]
pub struct ResultCache {
    store: StoreRef,
    ttl: TtlRange,
}

impl ResultCache {
    pub fn new(store: StoreRef, ttl: TtlRange) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> TtlRange {
        self.ttl
    }

    /// Looks up the cached result for `url`.
    pub async fn get_result(&self, url: &str) -> Result<Option<CachedResult>, CacheError> {
        let Some(raw) = self.store.get(url).await? else {
            return Ok(None);
        };
        let result = serde_json::from_str(&raw)?;
        Ok(Some(result))
    }

    /// Caches `result` for `url` with a freshly drawn lifetime.
    ///
    /// Returns the lifetime that was used.
    pub async fn put_result(
        &self,
        url: &str,
        result: &CachedResult,
    ) -> Result<Duration, CacheError> {
        let ttl = self.ttl.sample();
        self.put_result_with_ttl(url, result, ttl).await?;
        Ok(ttl)
    }

    /// Caches `result` for `url`, replacing any previous entry wholesale.
    pub async fn put_result_with_ttl(
        &self,
        url: &str,
        result: &CachedResult,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let raw = serde_json::to_string(result)?;
        self.store.set_with_expiry(url, &raw, ttl).await?;
        Ok(())
    }
}

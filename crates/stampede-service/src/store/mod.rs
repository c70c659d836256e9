//! Access to the external key/value store shared by all stampede instances.
//!
//! Every piece of cross-task and cross-process coordination goes through the
//! [`KeyValueStore`] capability: cached results, lock records, and the atomic primitives the
//! lock protocol depends on. The store is opened once at startup via [`connect_store`] and
//! passed around explicitly as a [`StoreRef`].
//!
//! Implementations never retry. Callers decide what a failed call means for them.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// The longest expiry a record may have. The memory backend clamps longer ones.
pub const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// A shared handle to the configured store backend.
pub type StoreRef = Arc<dyn KeyValueStore>;

/// Errors talking to the store.
///
/// These always mean "the store could not answer", never "the key does not exist".
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached, or the connection broke mid-request.
    #[error("store connection failed: {0}")]
    Connection(String),
    /// The store answered with an error.
    #[error("store protocol error: {0}")]
    Protocol(String),
    /// The store answered with something we did not expect.
    #[error("unexpected store reply: {0}")]
    Unexpected(String),
}

/// The capability set every store backend provides.
#[async_trait]
pub trait KeyValueStore: fmt::Debug + Send + Sync {
    /// Reads the value stored under `key`, returning `None` if there is none.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Unconditionally writes `value` under `key`, expiring after `ttl`.
    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration)
    -> Result<(), StoreError>;

    /// Atomically writes `value` under `key` only if `key` does not exist yet.
    ///
    /// Returns `false` exactly when the key already existed.
    async fn set_if_absent_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Removes `key`.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Atomically deletes `key` if and only if its current value equals `expected`.
    ///
    /// Returns `true` if a record was deleted.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError>;
}

/// Configuration of the [`KeyValueStore`] backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreConfig {
    /// A store living inside this process.
    ///
    /// This does not coordinate with other instances and is mostly useful for local
    /// development and tests.
    #[default]
    Memory,
    /// A Redis server.
    Redis(RedisStoreConfig),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedisStoreConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379/0`.
    pub url: String,
    /// Timeout for establishing a connection, including reconnects.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Timeout for a single command's reply.
    #[serde(default = "default_response_timeout", with = "humantime_serde")]
    pub response_timeout: Duration,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_response_timeout() -> Duration {
    Duration::from_secs(1)
}

impl RedisStoreConfig {
    /// Connects to `url` with the default timeouts.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: default_connect_timeout(),
            response_timeout: default_response_timeout(),
        }
    }
}

/// Opens the configured store.
pub async fn connect_store(config: &StoreConfig) -> Result<StoreRef, StoreError> {
    let store: StoreRef = match config {
        StoreConfig::Memory => {
            tracing::info!("Using in-process memory store");
            Arc::new(MemoryStore::new())
        }
        StoreConfig::Redis(redis) => {
            let store = RedisStore::connect_with(redis).await?;
            tracing::info!("Connected to redis store");
            Arc::new(store)
        }
    };
    Ok(store)
}

/// Converts a TTL into whole milliseconds, never returning zero.
///
/// A zero expiry is rejected by Redis and would mean "never store" for the memory backend.
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

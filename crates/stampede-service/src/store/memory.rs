use std::time::Duration;

use async_trait::async_trait;
use moka::ops::compute::{CompResult, Op};
use tokio::time::Instant;

use super::{KeyValueStore, MAX_TTL, StoreError};

#[derive(Debug, Clone)]
struct Record {
    value: String,
    ttl: Duration,
    expires_at: Instant,
}

impl Record {
    fn new(value: &str, ttl: Duration, now: Instant) -> Self {
        let ttl = ttl.min(MAX_TTL);
        Self {
            value: value.to_owned(),
            ttl,
            expires_at: now + ttl,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// A [`moka::Expiry`] evicting each record once its own TTL elapsed.
struct RecordExpiration;

impl moka::Expiry<String, Record> for RecordExpiration {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Record,
        _current_time: std::time::Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Record,
        _current_time: std::time::Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// An in-process [`KeyValueStore`].
///
/// Records live in a [`moka`] cache which evicts them after their TTL, whether or not they are
/// read again. The conditional primitives go through moka's per-key `and_compute_with`, which
/// makes them atomic the same way a single-threaded Redis server is.
///
/// Liveness is additionally checked against [`tokio::time::Instant`], so expiry follows a paused
/// test clock.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    records: moka::sync::Cache<String, Record>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            records: moka::sync::Cache::builder()
                .name("stampede-memory-store")
                .expire_after(RecordExpiration)
                .build(),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of live records.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.records
            .iter()
            .filter(|(_, record)| record.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        Ok(self
            .records
            .get(key)
            .filter(|record| record.is_live(now))
            .map(|record| record.value))
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let record = Record::new(value, ttl, Instant::now());
        self.records.insert(key.to_owned(), record);
        Ok(())
    }

    async fn set_if_absent_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let result = self
            .records
            .entry_by_ref(key)
            .and_compute_with(|entry| match entry {
                Some(entry) if entry.value().is_live(now) => Op::Nop,
                _ => Op::Put(Record::new(value, ttl, now)),
            });
        Ok(matches!(
            result,
            CompResult::Inserted(_) | CompResult::ReplacedWith(_)
        ))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.records.invalidate(key);
        Ok(())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let result = self
            .records
            .entry_by_ref(key)
            .and_compute_with(|entry| match entry {
                Some(entry) if entry.value().is_live(now) && entry.value().value == expected => {
                    Op::Remove
                }
                _ => Op::Nop,
            });
        Ok(matches!(result, CompResult::Removed(_)))
    }
}

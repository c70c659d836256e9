//! The per-URL coalescing protocol.
//!
//! A [`CoalescingFetcher`] resolves one URL for one caller, making sure that concurrent callers
//! for the same URL share one upstream fetch whenever coordination through the store works,
//! and that nobody waits for longer than one request timeout when it does not.
//!
//! Each invocation walks through these states:
//!
//! 1. `CheckCache`: A cached success is published and ends the invocation. A cached error ends
//!    it without publishing anything. On a miss, continue.
//! 2. `TryLock`: Try to acquire the URL's lock with a fresh token. The owner goes on to
//!    `Fetch`, everyone else to `WaitForLock`.
//! 3. `WaitForLock`: Poll the lock until it is released, then go back to `CheckCache`. If it
//!    is still held once the request timeout elapsed, `Fetch` without owning the lock.
//! 4. `Fetch`: Fetch from upstream and publish a successful body. Only the owner then writes
//!    the result to the cache and releases its lock.
//!
//! Store failures never fail an invocation. They degrade it instead: a failed cache read is a
//! miss, a failed acquisition means "not the owner", and a failed poll keeps waiting until the
//! timeout.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::caching::{CachedResult, LockGuard, LockManager, ResultCache};
use crate::config::Config;

use super::upstream::{Upstream, UpstreamError};

/// Timing and retry bounds of the coalescing protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPolicy {
    /// Timeout of an upstream fetch, lifetime of lock records, and the longest wait for a lock.
    pub request_timeout: Duration,
    /// How often a waiting caller checks the lock.
    pub poll_interval: Duration,
    /// How often a caller may go back to the cache after observing a released lock.
    pub max_lock_rounds: usize,
}

impl FetchPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            request_timeout: config.request_timeout,
            poll_interval: config.poll_interval,
            max_lock_rounds: config.max_lock_rounds,
        }
    }
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
            max_lock_rounds: 3,
        }
    }
}

/// How a fetch invocation was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    /// A cached success was published.
    CacheHit,
    /// A cached error was found. Nothing was published.
    CachedError,
    /// This invocation owned the lock, fetched, and populated the cache.
    Owner,
    /// This invocation fetched without owning the lock, and left the cache alone.
    Fallback,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CacheHit => "cache_hit",
            Self::CachedError => "cached_error",
            Self::Owner => "owner",
            Self::Fallback => "fallback",
        }
    }
}

enum State {
    CheckCache,
    TryLock,
    WaitForLock,
    Fetch(Option<LockGuard>),
}

enum LockWait {
    Released,
    TimedOut,
}

/// Resolves URLs through the result cache, coalescing concurrent fetches via per-URL locks.
#[derive(Debug, Clone)]
pub struct CoalescingFetcher {
    locks: LockManager,
    cache: ResultCache,
    upstream: Arc<dyn Upstream>,
    policy: FetchPolicy,
}

impl CoalescingFetcher {
    pub fn new(
        locks: LockManager,
        cache: ResultCache,
        upstream: Arc<dyn Upstream>,
        policy: FetchPolicy,
    ) -> Self {
        Self {
            locks,
            cache,
            upstream,
            policy,
        }
    }

    pub fn policy(&self) -> FetchPolicy {
        self.policy
    }

    /// Resolves `url`, sending its body to `output` unless the result is an error.
    ///
    /// If this invocation is cancelled while owning the lock, the lock is released in the
    /// background.
    pub async fn fetch(&self, url: &str, output: &mpsc::Sender<String>) -> Resolution {
        let mut rounds = 0;
        let mut state = State::CheckCache;

        let resolution = loop {
            state = match state {
                State::CheckCache => {
                    rounds += 1;
                    match self.cache.get_result(url).await {
                        Ok(Some(result)) => break self.publish_cached(url, result, output).await,
                        Ok(None) => State::TryLock,
                        Err(err) => {
                            tracing::warn!(
                                error = &err as &dyn std::error::Error,
                                url,
                                "Failed to read cached result"
                            );
                            State::TryLock
                        }
                    }
                }
                State::TryLock => {
                    match self.locks.try_lock(url, self.policy.request_timeout).await {
                        Ok(Some(guard)) => {
                            metric!(counter("fetcher.lock.acquired") += 1);
                            State::Fetch(Some(guard))
                        }
                        Ok(None) => State::WaitForLock,
                        Err(err) => {
                            tracing::warn!(
                                error = &err as &dyn std::error::Error,
                                url,
                                "Failed to acquire lock"
                            );
                            State::WaitForLock
                        }
                    }
                }
                State::WaitForLock => {
                    tracing::trace!(url, "Waiting for lock");
                    metric!(counter("fetcher.lock.wait") += 1);
                    match self.wait_for_lock(url).await {
                        LockWait::Released if rounds < self.policy.max_lock_rounds => {
                            tracing::trace!(url, "Lock released, checking cache again");
                            State::CheckCache
                        }
                        LockWait::Released => {
                            tracing::debug!(url, rounds, "Lock keeps changing hands, fetching");
                            State::Fetch(None)
                        }
                        LockWait::TimedOut => {
                            tracing::debug!(url, "Timed out waiting for lock, fetching");
                            State::Fetch(None)
                        }
                    }
                }
                State::Fetch(guard) => break self.fetch_upstream(url, guard, output).await,
            };
        };

        metric!(
            counter("fetcher.resolution") += 1,
            "resolution" => resolution.as_str(),
        );
        resolution
    }

    async fn publish_cached(
        &self,
        url: &str,
        result: CachedResult,
        output: &mpsc::Sender<String>,
    ) -> Resolution {
        tracing::trace!(url, is_error = result.is_error, "Found cached result");
        match result.into_body() {
            Some(body) => {
                publish(url, body, output).await;
                Resolution::CacheHit
            }
            None => Resolution::CachedError,
        }
    }

    /// Polls the lock until it is released, or the request timeout elapsed.
    ///
    /// A poll that is still pending at the deadline is abandoned.
    ///
    /// Failed polls do not end the wait early: a store hiccup should not turn every waiter into
    /// a fetcher at once.
    async fn wait_for_lock(&self, url: &str) -> LockWait {
        let deadline = Instant::now() + self.policy.request_timeout;
        let timeout = tokio::time::sleep_until(deadline);
        tokio::pin!(timeout);

        let mut polls = tokio::time::interval_at(
            Instant::now() + self.policy.poll_interval,
            self.policy.poll_interval,
        );

        loop {
            tokio::select! {
                biased;

                _ = &mut timeout => return LockWait::TimedOut,
                _ = polls.tick() => {
                    let polled = tokio::time::timeout_at(deadline, self.locks.is_locked(url)).await;
                    match polled {
                        Err(_elapsed) => {
                            tracing::debug!(url, "Lock check outlived the wait");
                            return LockWait::TimedOut;
                        }
                        Ok(Ok(false)) => return LockWait::Released,
                        Ok(Ok(true)) => {}
                        Ok(Err(err)) => {
                            tracing::warn!(
                                error = &err as &dyn std::error::Error,
                                url,
                                "Failed to check lock"
                            );
                        }
                    }
                }
            }
        }
    }

    async fn fetch_upstream(
        &self,
        url: &str,
        guard: Option<LockGuard>,
        output: &mpsc::Sender<String>,
    ) -> Resolution {
        if guard.is_none() {
            metric!(counter("fetcher.fallback") += 1);
        }
        tracing::debug!(url, owner = guard.is_some(), "Fetching from upstream");

        let timeout = self.policy.request_timeout;
        let fetched = tokio::time::timeout(timeout, self.upstream.fetch(url))
            .await
            .unwrap_or(Err(UpstreamError::Timeout(timeout)));

        let result = match fetched {
            Ok(body) => CachedResult::success(body),
            Err(err) => {
                tracing::info!(
                    error = &err as &dyn std::error::Error,
                    url,
                    "Upstream fetch failed"
                );
                CachedResult::error(err.to_string())
            }
        };

        if !result.is_error {
            publish(url, result.body.clone(), output).await;
        }

        let Some(guard) = guard else {
            return Resolution::Fallback;
        };

        if let Err(err) = self.cache.put_result(url, &result).await {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                url,
                "Failed to cache result"
            );
        }
        if let Err(err) = guard.release().await {
            // the lock record expires on its own after the request timeout
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                url,
                "Failed to release lock"
            );
        }

        Resolution::Owner
    }
}

async fn publish(url: &str, body: String, output: &mpsc::Sender<String>) {
    if output.send(body).await.is_err() {
        tracing::debug!(url, "Output closed, dropping result");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::caching::{LockToken, TtlRange};
    use crate::store::{KeyValueStore, MemoryStore, StoreError, StoreRef};
    use crate::test::{FailingStore, InstrumentedStore, ScriptedUpstream};

    const POLICY: FetchPolicy = FetchPolicy {
        request_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_secs(1),
        max_lock_rounds: 3,
    };

    fn fetcher(store: StoreRef, upstream: Arc<ScriptedUpstream>) -> CoalescingFetcher {
        CoalescingFetcher::new(
            LockManager::new(store.clone()),
            ResultCache::new(store, TtlRange::new(60, 120)),
            upstream,
            POLICY,
        )
    }

    fn output() -> (mpsc::Sender<String>, mpsc::Receiver<String>) {
        mpsc::channel(16)
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<String> {
        let mut items = Vec::new();
        while let Ok(item) = rx.try_recv() {
            items.push(item);
        }
        items
    }

    #[tokio::test(start_paused = true)]
    async fn test_miss_then_hit() {
        let store = Arc::new(MemoryStore::new());
        let upstream = Arc::new(ScriptedUpstream::new());
        let fetcher = fetcher(store.clone(), upstream.clone());
        let (tx, mut rx) = output();

        assert_eq!(fetcher.fetch("a", &tx).await, Resolution::Owner);
        assert_eq!(fetcher.fetch("a", &tx).await, Resolution::CacheHit);

        assert_eq!(drain(&mut rx), ["body of a", "body of a"]);
        assert_eq!(upstream.fetches("a"), 1);
        // the owner released its lock
        assert_eq!(store.get("a:lock").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_error_emits_nothing() {
        let store = Arc::new(MemoryStore::new());
        let upstream = Arc::new(ScriptedUpstream::new());
        upstream.fail("x");
        let fetcher = fetcher(store.clone(), upstream.clone());
        let (tx, mut rx) = output();

        assert_eq!(fetcher.fetch("x", &tx).await, Resolution::Owner);
        assert_eq!(fetcher.fetch("x", &tx).await, Resolution::CachedError);

        assert!(drain(&mut rx).is_empty());
        assert_eq!(upstream.fetches("x"), 1);

        let cached = ResultCache::new(store, TtlRange::new(1, 1))
            .get_result("x")
            .await
            .unwrap()
            .unwrap();
        assert!(cached.is_error);
        assert_eq!(cached.body, "request failed: scripted failure");
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_replays_owner_result() {
        let store = Arc::new(MemoryStore::new());
        let upstream = Arc::new(ScriptedUpstream::new());
        upstream.delay("a", Duration::from_millis(2500));
        let fetcher = fetcher(store.clone(), upstream.clone());
        let (tx, mut rx) = output();

        let (first, second) = tokio::join!(fetcher.fetch("a", &tx), async {
            // make sure the first invocation wins the lock
            tokio::time::sleep(Duration::from_millis(10)).await;
            fetcher.fetch("a", &tx).await
        });

        assert_eq!(first, Resolution::Owner);
        assert_eq!(second, Resolution::CacheHit);
        assert_eq!(drain(&mut rx), ["body of a", "body of a"]);
        assert_eq!(upstream.fetches("a"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_wait_falls_back() {
        let store = Arc::new(MemoryStore::new());
        let upstream = Arc::new(ScriptedUpstream::new());
        let fetcher = fetcher(store.clone(), upstream.clone());
        let (tx, mut rx) = output();

        // a stalled owner, whose record will outlive our wait
        let stalled = LockManager::new(store.clone());
        assert!(
            stalled
                .acquire("a", &LockToken::generate(), Duration::from_secs(60))
                .await
                .unwrap()
        );

        let start = Instant::now();
        assert_eq!(fetcher.fetch("a", &tx).await, Resolution::Fallback);
        let waited = start.elapsed();

        assert!(waited >= POLICY.request_timeout, "{waited:?}");
        assert!(
            waited <= POLICY.request_timeout + POLICY.poll_interval,
            "{waited:?}"
        );
        assert_eq!(drain(&mut rx), ["body of a"]);

        // a fallback fetch neither writes the cache nor touches the lock
        assert_eq!(store.get("a").await.unwrap(), None);
        assert!(stalled.is_locked("a").await.unwrap());
    }

    /// A store whose lock checks hang, and whose lock is always held by somebody else.
    #[derive(Debug, Default)]
    struct SlowLockStore(MemoryStore);

    #[async_trait::async_trait]
    impl KeyValueStore for SlowLockStore {
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            if key.ends_with(":lock") {
                tokio::time::sleep(Duration::from_secs(60)).await;
                return Ok(Some("someone else".into()));
            }
            self.0.get(key).await
        }

        async fn set_with_expiry(
            &self,
            key: &str,
            value: &str,
            ttl: Duration,
        ) -> Result<(), StoreError> {
            self.0.set_with_expiry(key, value, ttl).await
        }

        async fn set_if_absent_with_expiry(
            &self,
            _key: &str,
            _value: &str,
            _ttl: Duration,
        ) -> Result<bool, StoreError> {
            Ok(false)
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.0.delete(key).await
        }

        async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
            self.0.compare_and_delete(key, expected).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_lock_check_keeps_wait_bounded() {
        let store = Arc::new(SlowLockStore::default());
        let upstream = Arc::new(ScriptedUpstream::new());
        let fetcher = fetcher(store.clone(), upstream.clone());
        let (tx, mut rx) = output();

        let start = Instant::now();
        assert_eq!(fetcher.fetch("a", &tx).await, Resolution::Fallback);
        let waited = start.elapsed();

        assert!(waited >= POLICY.request_timeout, "{waited:?}");
        assert!(
            waited <= POLICY.request_timeout + POLICY.poll_interval,
            "{waited:?}"
        );
        assert_eq!(drain(&mut rx), ["body of a"]);
        assert_eq!(upstream.fetches("a"), 1);
    }

    /// A store where the lock always looks released, yet somebody else always wins it.
    #[derive(Debug, Default)]
    struct ContendedStore(MemoryStore);

    #[async_trait::async_trait]
    impl KeyValueStore for ContendedStore {
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            if key.ends_with(":lock") {
                return Ok(None);
            }
            self.0.get(key).await
        }

        async fn set_with_expiry(
            &self,
            key: &str,
            value: &str,
            ttl: Duration,
        ) -> Result<(), StoreError> {
            self.0.set_with_expiry(key, value, ttl).await
        }

        async fn set_if_absent_with_expiry(
            &self,
            _key: &str,
            _value: &str,
            _ttl: Duration,
        ) -> Result<bool, StoreError> {
            Ok(false)
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.0.delete(key).await
        }

        async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
            self.0.compare_and_delete(key, expected).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rounds_are_bounded() {
        let store = Arc::new(ContendedStore::default());
        let upstream = Arc::new(ScriptedUpstream::new());
        let fetcher = fetcher(store.clone(), upstream.clone());
        let (tx, mut rx) = output();

        let start = Instant::now();
        assert_eq!(fetcher.fetch("a", &tx).await, Resolution::Fallback);

        // one poll interval per round, then give up on coordination
        assert_eq!(
            start.elapsed(),
            POLICY.poll_interval * POLICY.max_lock_rounds as u32
        );
        assert_eq!(drain(&mut rx), ["body of a"]);
        assert_eq!(upstream.fetches("a"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_owner_releases_lock() {
        let store = Arc::new(MemoryStore::new());
        let upstream = Arc::new(ScriptedUpstream::new());
        upstream.delay("a", Duration::from_secs(3));
        let fetcher = Arc::new(fetcher(store.clone(), upstream.clone()));
        let (tx, _rx) = output();

        let task = {
            let fetcher = fetcher.clone();
            tokio::spawn(async move { fetcher.fetch("a", &tx).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(store.get("a:lock").await.unwrap().is_some());

        task.abort();
        let _ = task.await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(store.get("a:lock").await.unwrap(), None);
        // nothing was cached for the aborted fetch
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_output_still_populates() {
        let store = Arc::new(MemoryStore::new());
        let upstream = Arc::new(ScriptedUpstream::new());
        let fetcher = fetcher(store.clone(), upstream.clone());
        let (tx, rx) = output();
        drop(rx);

        assert_eq!(fetcher.fetch("a", &tx).await, Resolution::Owner);
        assert!(store.get("a").await.unwrap().is_some());
        assert_eq!(store.get("a:lock").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_outage_degrades_to_fallback() {
        let store = Arc::new(FailingStore);
        let upstream = Arc::new(ScriptedUpstream::new());
        let fetcher = fetcher(store, upstream.clone());
        let (tx, mut rx) = output();

        let start = Instant::now();
        assert_eq!(fetcher.fetch("a", &tx).await, Resolution::Fallback);

        // failing polls keep waiting until the timeout instead of falling back right away
        assert!(start.elapsed() >= POLICY.request_timeout);
        assert_eq!(drain(&mut rx), ["body of a"]);
        assert_eq!(upstream.fetches("a"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_timeout_is_cached() {
        let store = Arc::new(MemoryStore::new());
        let upstream = Arc::new(ScriptedUpstream::new());
        upstream.delay("slow", Duration::from_secs(30));
        let fetcher = fetcher(store.clone(), upstream.clone());
        let (tx, mut rx) = output();

        assert_eq!(fetcher.fetch("slow", &tx).await, Resolution::Owner);
        assert!(drain(&mut rx).is_empty());

        let raw = store.get("slow").await.unwrap().unwrap();
        let cached: CachedResult = serde_json::from_str(&raw).unwrap();
        assert_eq!(cached, CachedResult::error("request timed out after 5s"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_population_race() {
        let store = Arc::new(InstrumentedStore::new());
        let upstream = Arc::new(ScriptedUpstream::new());
        upstream.delay("a", Duration::from_millis(1500));
        let fetcher = Arc::new(fetcher(store.clone(), upstream.clone()));
        let (tx, mut rx) = output();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let fetcher = fetcher.clone();
            let tx = tx.clone();
            tasks.push(tokio::spawn(async move { fetcher.fetch("a", &tx).await }));
        }
        let mut resolutions = Vec::new();
        for task in tasks {
            resolutions.push(task.await.unwrap());
        }

        let owners = resolutions
            .iter()
            .filter(|r| **r == Resolution::Owner)
            .count();
        assert_eq!(owners, 1, "{resolutions:?}");
        assert!(
            resolutions
                .iter()
                .all(|r| matches!(r, Resolution::Owner | Resolution::CacheHit)),
            "{resolutions:?}"
        );
        assert_eq!(drain(&mut rx).len(), 8);
        assert_eq!(upstream.fetches("a"), 1);
        assert_eq!(store.cache_writes("a"), 1);
        assert_eq!(store.max_concurrent_holders(), 1);
    }
}

//! Tests against a real redis server, see [`crate::redis_url_from_env`].

use std::sync::Arc;
use std::time::Duration;

use stampede_service::caching::{CachedResult, LockManager, LockToken, ResultCache, TtlRange};
use stampede_service::store::{KeyValueStore, RedisStore, StoreRef};

use crate::{HitCounter, collect, redis_url, setup_service};

fn unique_key(name: &str) -> String {
    format!("stampede-test:{name}:{}", LockToken::generate())
}

#[tokio::test]
async fn test_redis_primitives() {
    let url = redis_url!();
    let store = RedisStore::connect(&url).await.unwrap();
    let key = unique_key("primitives");

    assert_eq!(store.get(&key).await.unwrap(), None);
    assert!(
        store
            .set_if_absent_with_expiry(&key, "one", Duration::from_secs(10))
            .await
            .unwrap()
    );
    assert!(
        !store
            .set_if_absent_with_expiry(&key, "two", Duration::from_secs(10))
            .await
            .unwrap()
    );
    assert!(!store.compare_and_delete(&key, "two").await.unwrap());
    assert!(store.compare_and_delete(&key, "one").await.unwrap());
    assert_eq!(store.get(&key).await.unwrap(), None);

    store
        .set_with_expiry(&key, "short", Duration::from_millis(100))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(store.get(&key).await.unwrap(), None);
}

#[tokio::test]
async fn test_redis_locks_and_cache() {
    let url = redis_url!();
    let store: StoreRef = Arc::new(RedisStore::connect(&url).await.unwrap());
    let url_key = unique_key("lock");

    let locks = LockManager::new(store.clone());
    let guard = locks
        .try_lock(&url_key, Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();
    assert!(
        locks
            .try_lock(&url_key, Duration::from_secs(5))
            .await
            .unwrap()
            .is_none()
    );
    guard.release().await.unwrap();
    assert!(!locks.is_locked(&url_key).await.unwrap());

    let cache = ResultCache::new(store, TtlRange::new(5, 10));
    cache
        .put_result(&url_key, &CachedResult::success("body"))
        .await
        .unwrap();
    assert_eq!(
        cache.get_result(&url_key).await.unwrap(),
        Some(CachedResult::success("body"))
    );
}

#[tokio::test]
async fn test_redis_stream() {
    let url = redis_url!();
    let store: StoreRef = Arc::new(RedisStore::connect(&url).await.unwrap());
    let upstream = HitCounter::new();
    // a fresh path per run, so results cached by earlier runs do not interfere
    let path = format!("delay/100ms/garbage_data/{}", LockToken::generate());

    let service = setup_service(store, |config| {
        config.urls = vec![upstream.url(&path).to_string()];
        config.number_of_requests = 6;
    });

    let items = collect(service.random_data_stream()).await;
    assert_eq!(items.len(), 6);
    assert_eq!(upstream.accesses(), 2);
}

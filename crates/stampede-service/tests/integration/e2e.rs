use std::sync::Arc;
use std::time::Duration;

use stampede_service::store::MemoryStore;

use crate::{HitCounter, collect, setup_service};

#[tokio::test]
async fn test_stream_coalesces_upstream_fetches() {
    let upstream = HitCounter::new();
    let service = setup_service(Arc::new(MemoryStore::new()), |config| {
        config.urls = vec![
            upstream.url("delay/200ms/garbage_data/a").to_string(),
            upstream.url("delay/200ms/garbage_data/b").to_string(),
        ];
        config.number_of_requests = 10;
    });

    let items = collect(service.random_data_stream()).await;

    assert_eq!(items.len(), 10);
    assert!(items.iter().all(|i| i == "a" || i == "b"), "{items:?}");

    // each URL was fetched at most once: one hit for `/delay`, one for its redirect target
    let hits = upstream.all_hits();
    assert!(hits.len() <= 4, "{hits:?}");
    assert!(hits.iter().all(|(_, count)| *count == 1), "{hits:?}");
}

#[tokio::test]
async fn test_instances_share_the_store() {
    let upstream = HitCounter::new();
    let store = Arc::new(MemoryStore::new());
    let configure = |config: &mut stampede_service::config::Config| {
        config.urls = vec![upstream.url("delay/300ms/garbage_data/shared").to_string()];
        config.number_of_requests = 5;
    };
    let first = setup_service(store.clone(), configure);
    let second = setup_service(store, configure);

    let (a, b) = tokio::join!(
        collect(first.random_data_stream()),
        collect(second.random_data_stream()),
    );

    assert_eq!(a.len() + b.len(), 10);
    assert_eq!(upstream.accesses(), 2);
}

#[tokio::test]
async fn test_cached_results_outlive_the_stream() {
    let upstream = HitCounter::new();
    let service = setup_service(Arc::new(MemoryStore::new()), |config| {
        config.urls = vec![upstream.url("garbage_data/x").to_string()];
        config.number_of_requests = 2;
    });

    assert_eq!(collect(service.random_data_stream()).await, ["x", "x"]);
    assert_eq!(upstream.accesses(), 1);

    assert_eq!(collect(service.random_data_stream()).await, ["x", "x"]);
    assert_eq!(upstream.accesses(), 0);
}

#[tokio::test]
async fn test_error_status_bodies_are_streamed() {
    let upstream = HitCounter::new();
    let service = setup_service(Arc::new(MemoryStore::new()), |config| {
        config.urls = vec![upstream.url("respond_statuscode/404/missing").to_string()];
        config.number_of_requests = 2;
    });

    assert_eq!(
        collect(service.random_data_stream()).await,
        ["missing", "missing"]
    );
    assert_eq!(upstream.accesses(), 1);
}

#[tokio::test]
async fn test_upstream_timeouts_are_cached() {
    let upstream = HitCounter::new();
    let service = setup_service(Arc::new(MemoryStore::new()), |config| {
        config.urls = vec![upstream.url("delay/2s/garbage_data/late").to_string()];
        config.number_of_requests = 4;
        config.request_timeout = Duration::from_millis(200);
    });

    assert!(collect(service.random_data_stream()).await.is_empty());
    assert!(collect(service.random_data_stream()).await.is_empty());
    assert_eq!(upstream.accesses(), 1);
}

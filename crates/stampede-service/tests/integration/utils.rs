use std::sync::Arc;
use std::time::Duration;

use stampede_service::config::Config;
use stampede_service::services::create_service_with;
use stampede_service::services::random_data::RandomDataService;
use stampede_service::services::upstream::HttpUpstream;
use stampede_service::store::StoreRef;
use stampede_test as test;
use tokio::sync::mpsc;

pub use test::HitCounter;

/// Setup tests and create a service fetching from real HTTP upstreams through `store`.
///
/// The `update_config` closure can modify the default configuration if needed before the
/// service is created. Polling is sped up so tests do not wait for whole seconds.
pub fn setup_service(
    store: StoreRef,
    update_config: impl FnOnce(&mut Config),
) -> RandomDataService {
    test::setup();

    let mut config = Config {
        poll_interval: Duration::from_millis(50),
        ..Default::default()
    };
    update_config(&mut config);
    config.validate().unwrap();

    let upstream = Arc::new(HttpUpstream::new(config.request_timeout));
    create_service_with(&config, store, upstream)
}

/// Reads a stream to its end.
pub async fn collect(mut stream: mpsc::Receiver<String>) -> Vec<String> {
    let mut items = Vec::new();
    while let Some(item) = stream.recv().await {
        items.push(item);
    }
    items
}

/// Returns the redis server to test against, if one was configured via `STAMPEDE_TEST_REDIS_URL`.
pub fn redis_url_from_env() -> Option<String> {
    std::env::var("STAMPEDE_TEST_REDIS_URL")
        .ok()
        .filter(|url| !url.is_empty())
}

/// Returns the redis server to test against.
///
/// If it is not configured this will exit the test early, as a poor substitute for skipping
/// tests.
#[macro_export]
macro_rules! redis_url {
    () => {
        match $crate::redis_url_from_env() {
            Some(url) => url,
            None => {
                println!("Skipping due to missing STAMPEDE_TEST_REDIS_URL");
                return;
            }
        }
    };
}

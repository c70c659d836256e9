//! Provides the stampede services and a way to initialize them.
//!
//! The main [`create_service`] fn connects the shared store named by the [`Config`], and wires
//! the [`LockManager`], [`ResultCache`] and [`HttpUpstream`] into a [`CoalescingFetcher`]. The
//! returned [`RandomDataService`] is the interface the transports talk to.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::caching::{LockManager, ResultCache};
use crate::config::Config;
use crate::store::{StoreRef, connect_store};

pub mod fetcher;
pub mod random_data;
pub mod upstream;

use self::fetcher::{CoalescingFetcher, FetchPolicy};
use self::random_data::RandomDataService;
use self::upstream::{HttpUpstream, Upstream};

pub async fn create_service(config: &Config) -> Result<RandomDataService> {
    config.validate().context("invalid configuration")?;

    let store = connect_store(&config.store())
        .await
        .context("failed to connect to the shared store")?;
    let upstream = Arc::new(HttpUpstream::new(config.request_timeout));

    Ok(create_service_with(config, store, upstream))
}

/// Wires the services on top of an existing store and upstream.
pub fn create_service_with(
    config: &Config,
    store: StoreRef,
    upstream: Arc<dyn Upstream>,
) -> RandomDataService {
    let fetcher = CoalescingFetcher::new(
        LockManager::new(store.clone()),
        ResultCache::new(store, config.cache_ttl()),
        upstream,
        FetchPolicy::from_config(config),
    );

    RandomDataService::new(fetcher, config.urls.clone(), config.number_of_requests)
}

//! # Stampede caching infrastructure
//!
//! Stampede sits in front of slow upstream HTTP endpoints and makes sure that many concurrent
//! callers asking for the same URL cause at most one upstream fetch at a time.
//!
//! Both building blocks in this module live in the shared external store, so they coordinate
//! not only the tasks of one process, but all stampede instances pointed at the same store.
//!
//! ## Result cache
//!
//! The [`ResultCache`] holds one [`CachedResult`] per URL under the URL itself as key. Failed
//! fetches are cached too, flagged with `is_error`, so that a failing upstream is not hit again
//! by every new caller. Lifetimes are drawn from a [`TtlRange`] for every write, which spreads
//! out the expiry of entries written at the same time.
//!
//! Records are never mutated in place. They are overwritten wholesale, or expire.
//!
//! ## Locks
//!
//! The [`LockManager`] hands out per-URL locks stored under `<url>:lock`. The record holds a
//! random [`LockToken`] identifying the acquisition that created it, and is only ever removed
//! by a compare-and-delete with that token. A lock record expires after the request timeout, so
//! a crashed owner only blocks its URL for a bounded time.
//!
//! A lock and a cached result for the same URL do not need to coexist: the lock only exists
//! between "decided to fetch" and "cache populated and lock released".
//!
//! ## Metrics
//!
//! - `fetcher.lock.abandoned`: Locks released from the drop path of a cancelled owner.
//!
//! See [`crate::services::fetcher`] for how these pieces are combined.

mod lock;
mod result_cache;

pub use lock::{LockError, LockGuard, LockManager, LockToken};
pub use result_cache::{CacheError, CachedResult, ResultCache, TtlRange};

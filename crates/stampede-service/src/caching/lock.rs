use std::fmt;
use std::time::Duration;

use crate::store::{StoreError, StoreRef};

const LOCK_KEY_SUFFIX: &str = ":lock";

/// Errors from the [`LockManager`].
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The store could not be asked about the lock.
    #[error("lock state unknown")]
    Store(#[from] StoreError),
}

/// A fencing token proving ownership of one particular lock acquisition.
///
/// Tokens carry 16 bytes from the thread-local CSPRNG, so two acquisition attempts never share
/// a token, even for the same URL.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LockToken").field(&self.0).finish()
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-URL distributed locks on top of the shared store.
///
/// A lock for `url` is the record `<url>:lock` holding the owner's [`LockToken`]. It is created
/// with set-if-absent and removed with compare-and-delete, so only the acquisition that
/// created a record can ever remove it. Records carry a TTL so that a crashed owner cannot
/// strand its waiters.
#[derive(Clone, Debug)]
pub struct LockManager {
    store: StoreRef,
}

impl LockManager {
    pub fn new(store: StoreRef) -> Self {
        Self { store }
    }

    /// The store key of the lock record for `url`.
    pub fn lock_key(url: &str) -> String {
        format!("{url}{LOCK_KEY_SUFFIX}")
    }

    /// Whether some task currently holds the lock for `url`.
    pub async fn is_locked(&self, url: &str) -> Result<bool, LockError> {
        let holder = self.store.get(&Self::lock_key(url)).await?;
        Ok(holder.is_some())
    }

    /// Tries to acquire the lock for `url` under the given `token`.
    ///
    /// Returns `false` if someone else holds the lock.
    pub async fn acquire(
        &self,
        url: &str,
        token: &LockToken,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let acquired = self
            .store
            .set_if_absent_with_expiry(&Self::lock_key(url), token.as_str(), ttl)
            .await?;
        Ok(acquired)
    }

    /// Releases the lock for `url` if it is still held under `token`.
    ///
    /// Releasing with a stale token is a no-op: the record then belongs to a later owner that
    /// acquired it after ours expired.
    pub async fn release(&self, url: &str, token: &LockToken) -> Result<(), LockError> {
        let released = self
            .store
            .compare_and_delete(&Self::lock_key(url), token.as_str())
            .await?;
        if !released {
            tracing::debug!(url, "Lock was no longer held by this owner");
        }
        Ok(())
    }

    /// Acquires the lock for `url` with a freshly generated token.
    ///
    /// On success, the returned [`LockGuard`] makes sure the lock is released even when the
    /// owning task is cancelled.
    pub async fn try_lock(&self, url: &str, ttl: Duration) -> Result<Option<LockGuard>, LockError> {
        let token = LockToken::generate();
        if self.acquire(url, &token, ttl).await? {
            Ok(Some(LockGuard {
                inner: Some((self.clone(), url.to_owned(), token)),
            }))
        } else {
            Ok(None)
        }
    }
}

/// Ownership of an acquired lock.
///
/// Call [`release`](Self::release) once the protected work is done. A guard that is dropped
/// without being released spawns the release onto the current tokio runtime instead.
#[derive(Debug)]
pub struct LockGuard {
    inner: Option<(LockManager, String, LockToken)>,
}

impl LockGuard {
    pub fn token(&self) -> Option<&LockToken> {
        self.inner.as_ref().map(|(_, _, token)| token)
    }

    /// Releases the lock.
    pub async fn release(mut self) -> Result<(), LockError> {
        match self.inner.take() {
            Some((manager, url, token)) => manager.release(&url, &token).await,
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some((manager, url, token)) = self.inner.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(url = %url, "Lock abandoned outside of a runtime, leaving it to expire");
            return;
        };

        metric!(counter("fetcher.lock.abandoned") += 1);
        runtime.spawn(async move {
            if let Err(err) = manager.release(&url, &token).await {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    url = %url,
                    "Failed to release abandoned lock"
                );
            }
        });
    }
}

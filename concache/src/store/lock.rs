//! Advisory lock on top of the fast store's `setnx`.
//!
//! The dispatcher serializes the decision of who starts a computation with
//! this lock. A TTL bounds how long a crashed holder can block others; a
//! guard dropped without [`StoreLock::release`] (e.g. by a cancelled request)
//! releases the lock from a spawned task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{KeyStore, StoreResult};
use crate::error::{CalcError, CalcResult};

/// Delay between acquisition attempts.
const RETRY_DELAY: Duration = Duration::from_millis(25);

static LOCK_TOKEN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A held store lock.
///
/// Prefer [`StoreLock::release`], which reports store errors. Dropping the
/// guard releases it in the background.
pub struct StoreLock {
    store: Arc<dyn KeyStore>,
    key: String,
    token: String,
    released: bool,
}

impl StoreLock {
    /// Acquires `key`, waiting up to `timeout`.
    ///
    /// The lock expires after `ttl` even if never released.
    pub async fn acquire(
        store: Arc<dyn KeyStore>,
        key: impl Into<String>,
        ttl: Duration,
        timeout: Duration,
    ) -> CalcResult<Self> {
        let key = key.into();
        let token = format!(
            "{}-{}",
            std::process::id(),
            LOCK_TOKEN_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let started = Instant::now();

        loop {
            if store.setnx(&key, token.clone()).await? {
                store.expire(&key, ttl).await?;
                debug!(key = %key, "Store lock acquired");
                return Ok(Self {
                    store,
                    key,
                    token,
                    released: false,
                });
            }

            // holder died between setnx and expire
            if store.ttl(&key).await?.is_none() && store.exists(&key).await? {
                store.expire(&key, ttl).await?;
            }

            if started.elapsed() >= timeout {
                warn!(key = %key, waited_ms = started.elapsed().as_millis() as u64, "Store lock wait timed out");
                return Err(CalcError::LockTimeout(key));
            }
            tokio::time::sleep(RETRY_DELAY).await;
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Releases the lock if it is still held by this guard.
    ///
    /// Compare-and-delete is two store calls; a lock that already expired
    /// and was re-acquired by someone else is left alone.
    pub async fn release(mut self) -> StoreResult<()> {
        self.released = true;
        release_owned(self.store.as_ref(), &self.key, &self.token).await
    }
}

async fn release_owned(store: &dyn KeyStore, key: &str, token: &str) -> StoreResult<()> {
    if store.get(key).await?.as_deref() == Some(token) {
        store.del(key).await?;
        debug!(key = %key, "Store lock released");
    }
    Ok(())
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(key = %self.key, "No runtime to release dropped lock, leaving it to expire");
            return;
        };
        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        runtime.spawn(async move {
            if let Err(e) = release_owned(store.as_ref(), &key, &token).await {
                warn!(key = %key, error = %e, "Failed to release dropped lock");
            }
        });
    }
}

impl std::fmt::Debug for StoreLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreLock")
            .field("key", &self.key)
            .field("token", &self.token)
            .finish()
    }
}

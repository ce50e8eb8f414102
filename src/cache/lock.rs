use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use log::trace;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};

/// Per-key mutual exclusion with a bounded number of keys held at once.
///
/// A caller first waits for the key's own lock, then for one permit of the
/// shared pool, so callers queued on a busy key never occupy a pool slot.
/// Lock state lives in memory only.
#[derive(Clone)]
pub struct LockPool {
    inner: Arc<Inner>,
}

struct Inner {
    locks: DashMap<String, Arc<Mutex<()>>>,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

/// Holds a key lock and a pool permit until dropped.
pub struct LockToken {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    permit: Option<OwnedSemaphorePermit>,
    inner: Arc<Inner>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireTimeout;

impl LockPool {
    pub fn new(max_locks: usize, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                locks: DashMap::new(),
                permits: Arc::new(Semaphore::new(max_locks)),
                timeout,
            }),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Waits up to the pool timeout for `key`.
    pub async fn acquire(&self, key: &str) -> Result<LockToken, AcquireTimeout> {
        let mutex = self.key_mutex(key);
        let permits = Arc::clone(&self.inner.permits);
        let acquire = async move {
            let guard = mutex.lock_owned().await;
            // The semaphore is never closed.
            let permit = permits.acquire_owned().await.ok()?;
            Some((guard, permit))
        };

        match tokio::time::timeout(self.inner.timeout, acquire).await {
            Ok(Some((guard, permit))) => {
                trace!("Acquired the lock on {key}");
                Ok(self.token(key, guard, permit))
            }
            Ok(None) | Err(_) => {
                self.inner.release_unused(key);
                Err(AcquireTimeout)
            }
        }
    }

    /// Takes `key` only if both the key and a pool permit are free right now.
    pub fn try_acquire(&self, key: &str) -> Option<LockToken> {
        let mutex = self.key_mutex(key);
        let token = mutex.try_lock_owned().ok().and_then(|guard| {
            let permit = Arc::clone(&self.inner.permits).try_acquire_owned().ok()?;
            Some(self.token(key, guard, permit))
        });
        if token.is_none() {
            self.inner.release_unused(key);
        }
        token
    }

    /// Number of keys with a holder or waiters.
    pub fn tracked_keys(&self) -> usize {
        self.inner.locks.len()
    }

    fn key_mutex(&self, key: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.inner.locks.entry(key.to_owned()).or_default().value())
    }

    fn token(&self, key: &str, guard: OwnedMutexGuard<()>, permit: OwnedSemaphorePermit) -> LockToken {
        LockToken {
            key: key.to_owned(),
            guard: Some(guard),
            permit: Some(permit),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Inner {
    // Removing under the shard lock is safe: nobody can clone the mutex out of
    // the map concurrently, so a count of one means no holder and no waiter.
    fn release_unused(&self, key: &str) {
        self.locks
            .remove_if(key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

impl Drop for LockToken {
    fn drop(&mut self) {
        self.permit.take();
        drop(self.guard.take());
        self.inner.release_unused(&self.key);
        trace!("Released the lock on {}", self.key);
    }
}

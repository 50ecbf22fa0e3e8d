//! Distributed locking for cross-instance stampede protection.
//!
//! A policy may opt into a lock on `lock:<key>` around its factory run so
//! that at most one *instance* rebuilds a key at a time (single-flight
//! already serializes callers within one instance). The contract is
//! deliberately small: acquire with a wait bound, hold for at most the
//! lease, release explicitly. What happens when the lock stays unavailable
//! is the policy's call ([`LockBehavior`](memotier_core::LockBehavior)).
//!
//! [`InProcessLock`] is the in-tree implementation: a semaphore per key.
//! It is real for tests and single-process deployments; network lock
//! implementations (Redis SET NX, database advisory locks) live with
//! their storage providers.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

use memotier_backend::BackendResult;
use memotier_core::{CacheKey, LockOptions};

/// A held lock. Dropping the lease releases the lock; [`release`] does so
/// explicitly and should be preferred so network implementations can
/// confirm the release.
///
/// [`release`]: LockLease::release
#[async_trait]
pub trait LockLease: Send {
    /// Releases the lock.
    async fn release(self: Box<Self>);
}

/// Cross-instance lock contract.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Tries to acquire the lock for `key` within `options.wait`.
    ///
    /// Returns `Ok(Some(lease))` on acquisition, `Ok(None)` when the wait
    /// window elapsed, and `Err` only for transport failures (which the
    /// caller treats the same as `None`).
    async fn acquire(
        &self,
        key: &CacheKey,
        options: &LockOptions,
    ) -> BackendResult<Option<Box<dyn LockLease>>>;
}

#[async_trait]
impl<L: DistributedLock + ?Sized> DistributedLock for Arc<L> {
    async fn acquire(
        &self,
        key: &CacheKey,
        options: &LockOptions,
    ) -> BackendResult<Option<Box<dyn LockLease>>> {
        (**self).acquire(key, options).await
    }
}

/// Semaphore-per-key lock for single-process topologies and tests.
///
/// The lease duration is not enforced: an in-process holder cannot crash
/// without dropping its permit, which is the failure leases exist for.
#[derive(Default)]
pub struct InProcessLock {
    locks: DashMap<CacheKey, Arc<Semaphore>>,
}

impl InProcessLock {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with a registered lock.
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }
}

struct PermitLease {
    _permit: OwnedSemaphorePermit,
}

#[async_trait]
impl LockLease for PermitLease {
    async fn release(self: Box<Self>) {
        // Dropping the permit releases the semaphore.
    }
}

#[async_trait]
impl DistributedLock for InProcessLock {
    async fn acquire(
        &self,
        key: &CacheKey,
        options: &LockOptions,
    ) -> BackendResult<Option<Box<dyn LockLease>>> {
        let semaphore = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone();

        // Spread the wait budget over the configured attempts.
        let attempts = options.retry.max(1);
        let per_attempt = options.wait / attempts;
        for attempt in 0..attempts {
            match tokio::time::timeout(per_attempt, semaphore.clone().acquire_owned()).await {
                Ok(Ok(permit)) => {
                    trace!(key = %key, attempt, "acquired in-process lock");
                    return Ok(Some(Box::new(PermitLease { _permit: permit })));
                }
                Ok(Err(_closed)) => return Ok(None),
                Err(_elapsed) => continue,
            }
        }
        trace!(key = %key, "in-process lock unavailable within wait window");
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn options(wait_ms: u64) -> LockOptions {
        LockOptions {
            wait: Duration::from_millis(wait_ms),
            ..LockOptions::default()
        }
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let lock = InProcessLock::new();
        let key = CacheKey::new("k");

        let lease = lock.acquire(&key, &options(50)).await.unwrap().unwrap();
        assert!(lock.acquire(&key, &options(50)).await.unwrap().is_none());

        lease.release().await;
        assert!(lock.acquire(&key, &options(50)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn distinct_keys_do_not_contend() {
        let lock = InProcessLock::new();
        let first = lock
            .acquire(&CacheKey::new("a"), &options(50))
            .await
            .unwrap();
        let second = lock
            .acquire(&CacheKey::new("b"), &options(50))
            .await
            .unwrap();
        assert!(first.is_some());
        assert!(second.is_some());
    }

    #[tokio::test]
    async fn waiter_gets_the_lock_when_holder_releases_in_time() {
        let lock = Arc::new(InProcessLock::new());
        let key = CacheKey::new("k");
        let lease = lock.acquire(&key, &options(200)).await.unwrap().unwrap();

        let contender = {
            let lock = Arc::clone(&lock);
            let key = key.clone();
            tokio::spawn(async move { lock.acquire(&key, &options(500)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        lease.release().await;

        let acquired = contender.await.unwrap().unwrap();
        assert!(acquired.is_some());
    }
}

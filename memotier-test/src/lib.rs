//! Test doubles for memotier storage providers.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use memotier_backend::{
    BackendError, BackendResult, DeleteStatus, PersistentStorage, RawEntry, StorageProvider,
};
use memotier_core::{CacheKey, CacheValue, HealthStatus, LayerStats, Raw, Tag};

/// Atomic operation counters shared by clones of one [`MockStorage`].
#[derive(Debug, Default)]
pub struct StorageCounters {
    /// Total reads.
    pub read_count: AtomicUsize,
    /// Reads that found a live entry.
    pub read_hit_count: AtomicUsize,
    /// Reads that found nothing.
    pub read_miss_count: AtomicUsize,
    /// Total writes.
    pub write_count: AtomicUsize,
    /// Total removes (by key or by tag).
    pub remove_count: AtomicUsize,
}

impl StorageCounters {
    /// Total reads.
    pub fn read_count(&self) -> usize {
        self.read_count.load(Ordering::SeqCst)
    }

    /// Reads that found a live entry.
    pub fn read_hit_count(&self) -> usize {
        self.read_hit_count.load(Ordering::SeqCst)
    }

    /// Reads that found nothing.
    pub fn read_miss_count(&self) -> usize {
        self.read_miss_count.load(Ordering::SeqCst)
    }

    /// Total writes.
    pub fn write_count(&self) -> usize {
        self.write_count.load(Ordering::SeqCst)
    }

    /// Total removes.
    pub fn remove_count(&self) -> usize {
        self.remove_count.load(Ordering::SeqCst)
    }

    /// Resets every counter to zero.
    pub fn reset(&self) {
        self.read_count.store(0, Ordering::SeqCst);
        self.read_hit_count.store(0, Ordering::SeqCst);
        self.read_miss_count.store(0, Ordering::SeqCst);
        self.write_count.store(0, Ordering::SeqCst);
        self.remove_count.store(0, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct Shared {
    entries: DashMap<CacheKey, (CacheValue<Raw>, Vec<Tag>)>,
    tags: DashMap<Tag, HashSet<CacheKey>>,
    counters: StorageCounters,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    health: AtomicU8,
}

/// Counting in-memory storage provider for tests.
///
/// Clones share state, so one `MockStorage` can stand in for a distributed
/// store visible to several cache instances. Reads and writes can be made
/// to fail on demand, and the reported health can be toggled, to exercise
/// the coordinator's skip-and-record behavior.
#[derive(Clone, Debug, Default)]
pub struct MockStorage {
    shared: Arc<Shared>,
}

impl MockStorage {
    /// Creates an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Operation counters.
    pub fn counters(&self) -> &StorageCounters {
        &self.shared.counters
    }

    /// Number of stored entries, expired ones included.
    pub fn entry_count(&self) -> usize {
        self.shared.entries.len()
    }

    /// Makes subsequent reads fail with a connection error.
    pub fn fail_reads(&self, fail: bool) {
        self.shared.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Makes subsequent writes fail with a connection error.
    pub fn fail_writes(&self, fail: bool) {
        self.shared.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Sets the health the provider reports.
    pub fn set_health(&self, health: HealthStatus) {
        self.shared.health.store(health as u8, Ordering::SeqCst);
    }

    /// Inserts raw bytes directly, bypassing counters (test setup).
    pub fn seed(&self, key: CacheKey, value: CacheValue<Raw>, tags: Vec<Tag>) {
        for tag in &tags {
            self.shared
                .tags
                .entry(tag.clone())
                .or_default()
                .insert(key.clone());
        }
        self.shared.entries.insert(key, (value, tags));
    }

    fn connection_error() -> BackendError {
        BackendError::Connection(Box::new(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "mock storage failure injected",
        )))
    }

    fn unlink_tags(&self, key: &CacheKey, tags: &[Tag]) {
        for tag in tags {
            if let Some(mut keys) = self.shared.tags.get_mut(tag) {
                keys.remove(key);
            }
        }
    }
}

#[async_trait]
impl StorageProvider for MockStorage {
    fn name(&self) -> &str {
        "mock"
    }

    async fn read(&self, key: &CacheKey) -> BackendResult<Option<RawEntry>> {
        if self.shared.fail_reads.load(Ordering::SeqCst) {
            return Err(Self::connection_error());
        }
        self.shared.counters.read_count.fetch_add(1, Ordering::SeqCst);
        let result = self
            .shared
            .entries
            .get(key)
            .map(|entry| RawEntry {
                value: entry.value().0.clone(),
                tags: entry.value().1.clone(),
            })
            .filter(|entry| !entry.value.is_expired());
        if result.is_some() {
            self.shared
                .counters
                .read_hit_count
                .fetch_add(1, Ordering::SeqCst);
        } else {
            self.shared
                .counters
                .read_miss_count
                .fetch_add(1, Ordering::SeqCst);
        }
        Ok(result)
    }

    async fn write(
        &self,
        key: &CacheKey,
        value: CacheValue<Raw>,
        tags: &[Tag],
    ) -> BackendResult<()> {
        if self.shared.fail_writes.load(Ordering::SeqCst) {
            return Err(Self::connection_error());
        }
        self.shared.counters.write_count.fetch_add(1, Ordering::SeqCst);
        if let Some((_, stale_tags)) = self
            .shared
            .entries
            .insert(key.clone(), (value, tags.to_vec()))
        {
            self.unlink_tags(key, &stale_tags);
        }
        for tag in tags {
            self.shared
                .tags
                .entry(tag.clone())
                .or_default()
                .insert(key.clone());
        }
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> BackendResult<DeleteStatus> {
        self.shared.counters.remove_count.fetch_add(1, Ordering::SeqCst);
        match self.shared.entries.remove(key) {
            Some((_, (_, tags))) => {
                self.unlink_tags(key, &tags);
                Ok(DeleteStatus::Deleted(1))
            }
            None => Ok(DeleteStatus::Missing),
        }
    }

    async fn remove_by_tag(&self, tag: &Tag) -> BackendResult<u64> {
        self.shared.counters.remove_count.fetch_add(1, Ordering::SeqCst);
        let keys: Vec<CacheKey> = self
            .shared
            .tags
            .remove(tag)
            .map(|(_, keys)| keys.into_iter().collect())
            .unwrap_or_default();
        let mut removed = 0;
        for key in keys {
            if let Some((_, (_, tags))) = self.shared.entries.remove(&key) {
                self.unlink_tags(&key, &tags);
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn exists(&self, key: &CacheKey) -> BackendResult<bool> {
        Ok(self
            .shared
            .entries
            .get(key)
            .is_some_and(|entry| !entry.value().0.is_expired()))
    }

    async fn health(&self) -> HealthStatus {
        match self.shared.health.load(Ordering::SeqCst) {
            0 => HealthStatus::Healthy,
            1 => HealthStatus::Degraded,
            _ => HealthStatus::Unhealthy,
        }
    }

    async fn stats(&self) -> BackendResult<Option<LayerStats>> {
        let counters = &self.shared.counters;
        Ok(Some(LayerStats {
            name: "mock".into(),
            hits: counters.read_hit_count() as u64,
            misses: counters.read_miss_count() as u64,
            sets: counters.write_count() as u64,
            removes: counters.remove_count() as u64,
            entry_count: self.shared.entries.len() as u64,
            ..LayerStats::default()
        }))
    }
}

/// Counting in-memory persistent (L3) provider for tests.
///
/// Wraps a [`MockStorage`] and adds the durable-tier surface: explicit
/// expired-entry cleanup and a storage-size query.
#[derive(Clone, Debug, Default)]
pub struct MockPersistentStorage {
    inner: MockStorage,
}

impl MockPersistentStorage {
    /// Creates an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// The wrapped storage, for counters and failure injection.
    pub fn inner(&self) -> &MockStorage {
        &self.inner
    }
}

#[async_trait]
impl StorageProvider for MockPersistentStorage {
    fn name(&self) -> &str {
        "mock-persistent"
    }

    async fn read(&self, key: &CacheKey) -> BackendResult<Option<RawEntry>> {
        self.inner.read(key).await
    }

    async fn write(
        &self,
        key: &CacheKey,
        value: CacheValue<Raw>,
        tags: &[Tag],
    ) -> BackendResult<()> {
        self.inner.write(key, value, tags).await
    }

    async fn remove(&self, key: &CacheKey) -> BackendResult<DeleteStatus> {
        self.inner.remove(key).await
    }

    async fn remove_by_tag(&self, tag: &Tag) -> BackendResult<u64> {
        self.inner.remove_by_tag(tag).await
    }

    async fn exists(&self, key: &CacheKey) -> BackendResult<bool> {
        self.inner.exists(key).await
    }

    async fn health(&self) -> HealthStatus {
        self.inner.health().await
    }

    async fn stats(&self) -> BackendResult<Option<LayerStats>> {
        self.inner.stats().await
    }
}

#[async_trait]
impl PersistentStorage for MockPersistentStorage {
    async fn cleanup_expired(&self) -> BackendResult<u64> {
        let expired: Vec<CacheKey> = self
            .inner
            .shared
            .entries
            .iter()
            .filter(|entry| entry.value().0.is_expired())
            .map(|entry| entry.key().clone())
            .collect();
        let mut reclaimed = 0;
        for key in expired {
            if self.inner.shared.entries.remove(&key).is_some() {
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn storage_size(&self) -> BackendResult<u64> {
        Ok(self
            .inner
            .shared
            .entries
            .iter()
            .map(|entry| entry.value().0.data().len() as u64)
            .sum())
    }
}

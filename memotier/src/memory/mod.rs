//! L1 in-memory cache.
//!
//! A concurrent map of live values (no in-process serialization) with
//! per-entry expiration, a bounded tag index, statistics, and capacity
//! eviction under one of three strategies (§[`EvictionPolicy`]).
//!
//! All operations are synchronous and non-suspending; the async tiers sit
//! above this cache in [`TieredCache`](crate::tiered::TieredCache).
//!
//! ## Expiration
//!
//! Expiration is checked on every read; expired entries read as misses and
//! are reclaimed lazily. [`MemoryCache::sweep_expired`] reclaims eagerly
//! and is driven by a background sweeper when refresh-ahead or sliding
//! expiration is in play (stale entries must leave the map even when
//! nobody reads them).

mod entry;
mod eviction;
mod stats;
mod tags;

use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use tracing::debug;

use memotier_core::{CacheKey, LayerStats, Tag};

use crate::config::CacheOptions;

pub use entry::EntryMeta;
pub use eviction::EvictionPolicy;

use entry::{Entry, now_ms};
use eviction::AccessList;
use stats::MemoryStats;
use tags::TagIndex;

/// Heuristic per-entry overhead (map slot, entry struct, access state)
/// used for the estimated-memory statistic.
const AVG_ENTRY_SIZE: u64 = 256;

/// Fraction of the high-water mark eviction drains down to.
const LOW_WATER_RATIO: f64 = 0.9;

/// Construction-time configuration of the L1 cache.
#[derive(Clone, Debug)]
pub struct MemoryCacheConfig {
    /// Entry-count high-water mark; crossing it triggers eviction.
    pub max_entries: usize,
    /// Eviction strategy.
    pub eviction_policy: EvictionPolicy,
    /// Probabilistic-strategy update probability, in `(0, 1]`.
    pub lru_update_probability: f64,
    /// Bound on live tag associations.
    pub max_tag_mappings: usize,
    /// When `false`, `remove_by_tag` clears the whole cache.
    pub efficient_tag_invalidation: bool,
    /// Maintain hit/miss/eviction counters.
    pub enable_statistics: bool,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        MemoryCacheConfig {
            max_entries: 100_000,
            eviction_policy: EvictionPolicy::default(),
            lru_update_probability: 0.01,
            max_tag_mappings: 10_000,
            efficient_tag_invalidation: true,
            enable_statistics: true,
        }
    }
}

impl From<&CacheOptions> for MemoryCacheConfig {
    fn from(options: &CacheOptions) -> Self {
        MemoryCacheConfig {
            max_entries: options.max_entries,
            eviction_policy: options.eviction_policy,
            lru_update_probability: options.lru_update_probability,
            max_tag_mappings: options.max_tag_mappings,
            efficient_tag_invalidation: options.efficient_tag_invalidation,
            enable_statistics: options.enable_statistics,
        }
    }
}

/// Concurrent in-memory cache with TTL, tag indexing, and capacity
/// eviction.
///
/// Values are stored as `Arc<dyn Any>`; typed reads downcast and clone.
/// A type mismatch on a reused key reads as a miss.
pub struct MemoryCache {
    entries: DashMap<CacheKey, Entry>,
    order: Mutex<AccessList>,
    tags: TagIndex,
    stats: MemoryStats,
    config: MemoryCacheConfig,
    low_water: usize,
}

impl MemoryCache {
    /// Creates a cache with the given configuration.
    pub fn new(config: MemoryCacheConfig) -> Self {
        let low_water = ((config.max_entries as f64 * LOW_WATER_RATIO) as usize)
            .min(config.max_entries.saturating_sub(1));
        MemoryCache {
            entries: DashMap::new(),
            order: Mutex::new(AccessList::new()),
            tags: TagIndex::new(config.max_tag_mappings),
            stats: MemoryStats::new(config.enable_statistics),
            low_water,
            config,
        }
    }

    /// Creates a cache with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(MemoryCacheConfig::default())
    }

    fn order(&self) -> MutexGuard<'_, AccessList> {
        self.order.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Observing read: checks expiration, updates sliding window and
    /// access state per the eviction strategy.
    pub fn get<T>(&self, key: &CacheKey) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.get_with_meta(key).map(|(value, _)| value)
    }

    /// Observing read that also returns the entry's timing metadata
    /// (used for refresh-ahead decisions).
    pub fn get_with_meta<T>(&self, key: &CacheKey) -> Option<(T, EntryMeta)>
    where
        T: Clone + Send + Sync + 'static,
    {
        let now = now_ms();
        let looked_up = match self.entries.get(key) {
            Some(entry) => {
                if entry.is_expired(now) {
                    None
                } else {
                    entry.touch(now);
                    Some((entry.value_cloned::<T>(), entry.meta(now)))
                }
            }
            None => {
                self.stats.miss();
                return None;
            }
        };
        // The map guard is dropped here; taking the order lock while
        // holding a shard guard would invert the lock order with eviction.
        match looked_up {
            Some((Some(value), meta)) => {
                self.record_access(key);
                self.stats.hit();
                Some((value, meta))
            }
            Some((None, _)) => {
                // Type mismatch on a reused key.
                self.stats.miss();
                None
            }
            None => {
                self.remove_expired(key);
                self.stats.miss();
                None
            }
        }
    }

    /// Non-observing read: no sliding update, no access-order update, no
    /// statistics. Used by the fast decorator path.
    pub fn peek<T>(&self, key: &CacheKey) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let entry = self.entries.get(key)?;
        if entry.is_expired(now_ms()) {
            return None;
        }
        entry.value_cloned::<T>()
    }

    /// Inserts or replaces an entry.
    ///
    /// Records absolute expiration `now + ttl`, links tags in both
    /// directions (respecting the mapping bound; replacement drops stale
    /// links first), and triggers eviction past the high-water mark.
    pub fn set<T>(
        &self,
        key: CacheKey,
        value: T,
        ttl: std::time::Duration,
        sliding: Option<std::time::Duration>,
        tags: &[Tag],
    ) where
        T: Send + Sync + 'static,
    {
        let entry = Entry::new(Arc::new(value), ttl, sliding, tags.to_vec());
        self.entries.insert(key.clone(), entry);
        self.tags.link(&key, tags);
        if self.config.eviction_policy.uses_order_list() {
            self.order().touch(&key);
        }
        self.stats.set();
        if self.entries.len() > self.config.max_entries {
            self.evict();
        }
    }

    /// Removes an entry and unlinks its tags. Returns whether a live
    /// entry was removed.
    pub fn remove(&self, key: &CacheKey) -> bool {
        let removed = self.entries.remove(key).is_some();
        self.tags.unlink(key);
        if self.config.eviction_policy.uses_order_list() {
            self.order().remove(key);
        }
        if removed {
            self.stats.remove();
        }
        removed
    }

    /// Removes every entry carrying `tag`, returning the removed count.
    ///
    /// With efficient tag invalidation disabled the entire cache is
    /// cleared instead — intentional: the alternative is a full scan.
    pub fn remove_by_tag(&self, tag: &Tag) -> u64 {
        if !self.config.efficient_tag_invalidation {
            let count = self.entries.len() as u64;
            debug!(tag = %tag, "efficient tag invalidation disabled, clearing cache");
            self.clear();
            return count;
        }
        let keys = self.tags.keys_for(tag);
        let mut removed = 0;
        for key in keys {
            if self.remove(&key) {
                removed += 1;
            }
        }
        removed
    }

    /// Whether a live entry exists. Non-observing: does not update access
    /// order or the sliding window.
    pub fn exists(&self, key: &CacheKey) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now_ms()))
    }

    /// Removes all entries and tag mappings.
    pub fn clear(&self) {
        self.entries.clear();
        self.tags.clear();
        self.order().clear();
    }

    /// Number of stored entries, expired-but-unreclaimed included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of the current keys (used by pattern invalidation).
    pub fn keys(&self) -> Vec<CacheKey> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Live tag-to-key association count.
    pub fn tag_mapping_count(&self) -> usize {
        self.tags.mapping_count()
    }

    /// Eagerly reclaims expired entries, returning the reclaimed count.
    pub fn sweep_expired(&self) -> u64 {
        let now = now_ms();
        let expired: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();
        let mut reclaimed = 0;
        for key in expired {
            if self.remove_expired(&key) {
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            debug!(reclaimed, "expiration sweep reclaimed entries");
        }
        reclaimed
    }

    /// Statistics snapshot. Estimated memory usage is entry count times an
    /// average-entry-size heuristic.
    pub fn stats(&self) -> LayerStats {
        let entry_count = self.entries.len() as u64;
        self.stats.snapshot(
            entry_count,
            entry_count * AVG_ENTRY_SIZE,
            self.tags.mapping_count() as u64,
        )
    }

    fn record_access(&self, key: &CacheKey) {
        match self.config.eviction_policy {
            EvictionPolicy::Precise => self.order().touch(key),
            EvictionPolicy::Probabilistic => {
                if rand::random::<f64>() < self.config.lru_update_probability {
                    self.order().touch(key);
                }
            }
            EvictionPolicy::Clock => {}
        }
    }

    /// Removes `key` only if it is (still) expired; a concurrent fresh
    /// insert wins. Returns whether an entry was reclaimed.
    fn remove_expired(&self, key: &CacheKey) -> bool {
        let now = now_ms();
        let removed = self
            .entries
            .remove_if(key, |_, entry| entry.is_expired(now))
            .is_some();
        if removed {
            self.tags.unlink(key);
            if self.config.eviction_policy.uses_order_list() {
                self.order().remove(key);
            }
            self.stats.remove();
        }
        removed
    }

    /// Drains the cache down to the low-water mark.
    fn evict(&self) {
        match self.config.eviction_policy {
            EvictionPolicy::Precise | EvictionPolicy::Probabilistic => self.evict_lru(),
            EvictionPolicy::Clock => self.evict_clock(),
        }
    }

    fn evict_lru(&self) {
        let mut order = self.order();
        while self.entries.len() > self.low_water {
            let Some(key) = order.pop_lru() else {
                break;
            };
            if self.entries.remove(&key).is_some() {
                self.tags.unlink(&key);
                self.stats.eviction();
            }
        }
    }

    /// Clock sweep: clear every access bit; entries whose bit was already
    /// clear are candidates, evicted oldest-first. Entries whose bit was
    /// set keep their second chance until the next sweep.
    fn evict_clock(&self) {
        let mut candidates: Vec<(u64, CacheKey)> = Vec::new();
        for entry in self.entries.iter() {
            if !entry.value().clear_access_bit() {
                candidates.push((entry.value().last_access(), entry.key().clone()));
            }
        }
        candidates.sort_unstable_by_key(|(ticks, _)| *ticks);
        for (_, key) in candidates {
            if self.entries.len() <= self.low_water {
                break;
            }
            if self.entries.remove(&key).is_some() {
                self.tags.unlink(&key);
                self.stats.eviction();
            }
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::with_defaults()
    }
}

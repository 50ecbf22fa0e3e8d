//! L1 statistics counters.
//!
//! Per-counter atomics, incremented on every hit/miss/eviction when
//! enabled. Disabling statistics turns every record call into a branch on
//! a plain bool, eliminating the atomic traffic from the hot path.

use std::sync::atomic::{AtomicU64, Ordering};

use memotier_core::LayerStats;

#[derive(Debug)]
pub(crate) struct MemoryStats {
    enabled: bool,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    sets: AtomicU64,
    removes: AtomicU64,
}

impl MemoryStats {
    pub(crate) fn new(enabled: bool) -> Self {
        MemoryStats {
            enabled,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            removes: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn hit(&self) {
        if self.enabled {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn miss(&self) {
        if self.enabled {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn eviction(&self) {
        if self.enabled {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn set(&self) {
        if self.enabled {
            self.sets.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn remove(&self) {
        if self.enabled {
            self.removes.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(
        &self,
        entry_count: u64,
        memory_bytes: u64,
        tag_mappings: u64,
    ) -> LayerStats {
        LayerStats {
            name: "memory".into(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
            errors: 0,
            avg_latency_us: 0.0,
            entry_count,
            memory_bytes: Some(memory_bytes),
            tag_mappings: Some(tag_mappings),
        }
    }
}

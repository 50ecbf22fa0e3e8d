//! Per-layer statistics records.

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Counters for one cache layer, as a point-in-time snapshot.
///
/// Estimated memory footprint and tag-mapping count are reported by the
/// in-memory layer only; out-of-process layers leave them `None`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerStats {
    /// Layer name (e.g. "memory", "redis").
    pub name: SmolStr,
    /// Read operations that found a live entry.
    pub hits: u64,
    /// Read operations that found nothing (or only an expired entry).
    pub misses: u64,
    /// Entries removed by capacity eviction.
    pub evictions: u64,
    /// Write operations.
    pub sets: u64,
    /// Remove operations (explicit, tag-driven, or backplane-driven).
    pub removes: u64,
    /// Operations that failed.
    pub errors: u64,
    /// Mean operation latency in microseconds.
    pub avg_latency_us: f64,
    /// Live entry count.
    pub entry_count: u64,
    /// Estimated memory footprint in bytes (in-memory layer only).
    pub memory_bytes: Option<u64>,
    /// Live tag-to-key associations (in-memory layer only).
    pub tag_mappings: Option<u64>,
}

impl LayerStats {
    /// Hit ratio over all observing reads, 0.0 when no reads happened.
    pub fn hit_ratio(&self) -> f64 {
        let reads = self.hits + self.misses;
        if reads == 0 {
            0.0
        } else {
            self.hits as f64 / reads as f64
        }
    }

    /// Folds another layer's counters into this record (used for
    /// pipeline-wide totals).
    pub fn merge(&mut self, other: &LayerStats) {
        self.hits += other.hits;
        self.misses += other.misses;
        self.evictions += other.evictions;
        self.sets += other.sets;
        self.removes += other.removes;
        self.errors += other.errors;
        self.entry_count += other.entry_count;
        if let Some(bytes) = other.memory_bytes {
            *self.memory_bytes.get_or_insert(0) += bytes;
        }
        if let Some(mappings) = other.tag_mappings {
            *self.tag_mappings.get_or_insert(0) += mappings;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_ratio_handles_zero_reads() {
        assert_eq!(LayerStats::default().hit_ratio(), 0.0);
    }

    #[test]
    fn hit_ratio_is_hits_over_reads() {
        let stats = LayerStats {
            hits: 3,
            misses: 1,
            ..LayerStats::default()
        };
        assert_eq!(stats.hit_ratio(), 0.75);
    }

    #[test]
    fn merge_sums_counters() {
        let mut total = LayerStats {
            hits: 1,
            memory_bytes: Some(10),
            ..LayerStats::default()
        };
        total.merge(&LayerStats {
            hits: 2,
            misses: 5,
            memory_bytes: Some(20),
            ..LayerStats::default()
        });
        assert_eq!(total.hits, 3);
        assert_eq!(total.misses, 5);
        assert_eq!(total.memory_bytes, Some(30));
    }
}

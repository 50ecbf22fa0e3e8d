#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

/// Engine configuration surface.
///
/// [`CacheOptions`](config::CacheOptions) collects every recognized option
/// (tier TTL clamps, eviction strategy, tag-index bounds, stampede and lock
/// defaults) with serde support and validation.
pub mod config;

/// Error types for cache operations.
///
/// Defines [`CacheError`], the engine-level taxonomy: transient storage
/// failures, serialization failures, stampede timeouts, factory failures,
/// lock unavailability, shutdown rejection, and configuration errors.
pub mod error;

/// Hit/miss callback events.
pub mod events;

/// Single-flight coordination.
///
/// When a cache entry is missing, concurrent requests for the same key
/// would all invoke the factory — the stampede problem. This module
/// provides [`FlightGroup`](flight::FlightGroup), which lets a bounded
/// number of callers build while the rest wait for the broadcast result.
pub mod flight;

/// Distributed locking for cross-instance stampede protection.
pub mod lock;

/// The cache manager: the top-level entry point decorators call.
pub mod manager;

/// L1 in-memory cache with expiration, eviction, and tag indexing.
pub mod memory;

/// Metrics sink trait and optional `metrics`-crate recorder.
pub mod metrics;

/// Background task offloading.
///
/// Refresh-ahead recomputation, asynchronous L2/L3 writes, and the
/// expiration sweeper all run as offloaded tasks managed by
/// [`OffloadManager`](offload::OffloadManager), with per-key deduplication.
pub mod offload;

/// Policy sources, registry, and priority-merge resolution.
pub mod registry;

/// Tiered storage coordination (L1 → L2 → L3 plus backplane).
pub mod tiered;

pub use config::CacheOptions;
pub use error::CacheError;
pub use manager::{CacheManager, CacheManagerBuilder, CacheableValue};
pub use memory::{EvictionPolicy, MemoryCache, MemoryCacheConfig};
pub use metrics::MetricsSink;
pub use registry::{PolicyRegistry, PolicyRegistryBuilder, PolicySource, StaticSource};
pub use tiered::{CacheStats, TieredCache, TieredCacheBuilder};

pub use memotier_core::{
    CacheArg, CacheKey, CachePolicy, CacheValue, FastKeyGenerator, HealthStatus, KeyGenerator,
    LayerStats, LockBehavior, LockOptions, PolicyContribution, PolicyFields, PolicyFragment,
    PolicyResolution, Raw, ReadableKeyGenerator, StampedeOptions, Tag,
};

/// The `memotier` prelude.
///
/// ```rust
/// use memotier::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        CacheArg, CacheError, CacheKey, CacheManager, CacheOptions, CacheableValue, Tag,
    };
}

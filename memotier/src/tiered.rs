//! Tiered storage coordination.
//!
//! [`TieredCache`] composes L1 (in-memory), an optional L2 (distributed),
//! an optional L3 (persistent), and an optional backplane into one
//! read/write pipeline:
//!
//! - **Reads** walk L1 → L2 → L3; any hit warms the tiers above it (L1
//!   with a clamped TTL). A failing layer is skipped, logged, counted, and
//!   never propagates — the read degrades to a miss.
//! - **Writes** go through every enabled tier; with async L2 writes
//!   enabled the remote tiers are written by bounded background tasks
//!   with one best-effort retry.
//! - **Invalidations** go to every tier, then publish on the backplane.
//!   Inbound backplane messages apply to L1 only — the publisher already
//!   wrote through the shared tiers — and self-origin messages are
//!   discarded.
//!
//! Shutdown is two-phase: stop intake, drain background writes, then stop
//! the listeners.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Semaphore, watch};
use tracing::{debug, warn};

use memotier_backend::{
    Backplane, BackendError, Invalidation, PersistentStorage, Storage, StorageProvider,
};
use memotier_core::{CacheKey, CacheValue, HealthStatus, LayerStats, Tag};

use crate::config::CacheOptions;
use crate::error::CacheError;
use crate::memory::{MemoryCache, MemoryCacheConfig};
use crate::offload::OffloadManager;

/// Bound on concurrently dispatched background writes.
const ASYNC_WRITE_CONCURRENCY: usize = 32;

/// Delay before the single best-effort retry of a failed background write.
const ASYNC_WRITE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// How long shutdown waits for background work to drain.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Coordinator-side observations of one remote layer.
#[derive(Debug, Default)]
struct LayerTelemetry {
    ops: AtomicU64,
    total_us: AtomicU64,
    errors: AtomicU64,
}

impl LayerTelemetry {
    fn record(&self, elapsed: Duration, ok: bool) {
        self.ops.fetch_add(1, Ordering::Relaxed);
        self.total_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        if !ok {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn overlay(&self, stats: &mut LayerStats) {
        let ops = self.ops.load(Ordering::Relaxed);
        if ops > 0 {
            stats.avg_latency_us = self.total_us.load(Ordering::Relaxed) as f64 / ops as f64;
        }
        stats.errors += self.errors.load(Ordering::Relaxed);
    }
}

/// Pipeline statistics: per-layer records plus aggregated totals.
#[derive(Clone, Debug)]
pub struct CacheStats {
    /// One record per enabled layer, L1 first.
    pub layers: Vec<LayerStats>,
    /// Sum over all layers.
    pub total: LayerStats,
}

/// The composed multi-tier pipeline.
pub struct TieredCache {
    memory: Arc<MemoryCache>,
    l2: Option<Arc<dyn StorageProvider>>,
    l3: Option<Arc<dyn PersistentStorage>>,
    backplane: Option<Arc<dyn Backplane>>,
    options: Arc<CacheOptions>,
    offload: OffloadManager,
    write_limiter: Arc<Semaphore>,
    l2_telemetry: Arc<LayerTelemetry>,
    l3_telemetry: Arc<LayerTelemetry>,
    shutdown: watch::Sender<bool>,
    disposed: AtomicBool,
}

impl TieredCache {
    /// Creates a builder.
    pub fn builder() -> TieredCacheBuilder {
        TieredCacheBuilder::new()
    }

    /// The L1 cache.
    pub fn memory(&self) -> &MemoryCache {
        &self.memory
    }

    /// The engine options this pipeline runs under.
    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    /// The background task manager (refresh-ahead tasks share it).
    pub fn offload(&self) -> &OffloadManager {
        &self.offload
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Clamps a caller TTL for L1: `min(ttl, l1_max_expiration)`, floored
    /// at `l1_default_expiration` when the inbound TTL exceeds the L1
    /// ceiling. Short TTLs pass through untouched.
    fn clamp_l1(&self, ttl: Duration) -> Duration {
        if ttl > self.options.l1_max_expiration {
            self.options
                .l1_max_expiration
                .max(self.options.l1_default_expiration)
        } else {
            ttl
        }
    }

    /// Read-through get across all tiers with upper-tier warming.
    ///
    /// Never fails: layer errors are logged and the read continues with
    /// the next tier. A corrupt L2/L3 entry (deserialization failure) is
    /// evicted from that layer and read as a miss.
    pub async fn get<T>(&self, key: &CacheKey) -> Option<T>
    where
        T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        if let Some(value) = self.memory.get::<T>(key) {
            return Some(value);
        }

        if let Some(l2) = self.enabled_l2() {
            if let Some((value, tags)) = self.read_layer::<T>(l2, &self.l2_telemetry, key).await {
                let remaining = value.ttl().unwrap_or(self.options.l1_default_expiration);
                let data = value.into_inner();
                self.memory
                    .set(key.clone(), data.clone(), self.clamp_l1(remaining), None, &tags);
                return Some(data);
            }
        }

        if let Some(l3) = self.l3.clone() {
            let provider: Arc<dyn StorageProvider> = l3;
            if let Some((value, tags)) = self
                .read_layer::<T>(&provider, &self.l3_telemetry, key)
                .await
            {
                let remaining = value.ttl().unwrap_or(self.options.l1_default_expiration);
                let data = value.data().clone();
                self.memory
                    .set(key.clone(), data.clone(), self.clamp_l1(remaining), None, &tags);
                if let Some(l2) = self.enabled_l2() {
                    let start = Instant::now();
                    let result = l2.set(key, &value, &tags).await;
                    self.l2_telemetry.record(start.elapsed(), result.is_ok());
                    if let Err(e) = result {
                        warn!(key = %key, layer = l2.name(), error = %e, "tier warm write failed");
                    }
                }
                return Some(data);
            }
        }

        None
    }

    async fn read_layer<T>(
        &self,
        provider: &Arc<dyn StorageProvider>,
        telemetry: &LayerTelemetry,
        key: &CacheKey,
    ) -> Option<(CacheValue<T>, Vec<Tag>)>
    where
        T: DeserializeOwned + Send,
    {
        let start = Instant::now();
        let result = provider.get::<T>(key).await;
        telemetry.record(start.elapsed(), result.is_ok());
        match result {
            Ok(hit) => hit.filter(|(value, _)| !value.is_expired()),
            Err(BackendError::Format(e)) => {
                // Corrupt entry: evict it so the next write starts clean.
                warn!(key = %key, layer = provider.name(), error = %e, "corrupt cache entry, evicting");
                let _ = provider.remove(key).await;
                None
            }
            Err(e) => {
                warn!(key = %key, layer = provider.name(), error = %e, "layer read failed, skipping");
                None
            }
        }
    }

    /// Write-through set.
    ///
    /// L1 is always written synchronously (with the clamped TTL). Remote
    /// tiers are written in parallel, or dispatched to bounded background
    /// tasks when async L2 writes are enabled. Failures are logged and
    /// counted, never propagated — the computed value already belongs to
    /// the caller.
    pub async fn set<T>(
        &self,
        key: &CacheKey,
        value: &T,
        ttl: Duration,
        sliding: Option<Duration>,
        tags: &[Tag],
    ) where
        T: Clone + Serialize + Send + Sync + 'static,
    {
        self.memory
            .set(key.clone(), value.clone(), self.clamp_l1(ttl), sliding, tags);

        let envelope = CacheValue::with_ttl(value.clone(), ttl);
        if self.options.enable_async_l2_writes {
            if let Some(l2) = self.enabled_l2() {
                self.dispatch_write(Arc::clone(l2), &self.l2_telemetry, key, &envelope, tags);
            }
            if let Some(l3) = &self.l3 {
                let provider: Arc<dyn StorageProvider> = l3.clone();
                self.dispatch_write(provider, &self.l3_telemetry, key, &envelope, tags);
            }
        } else {
            let l2_write = async {
                if let Some(l2) = self.enabled_l2() {
                    let start = Instant::now();
                    let result = l2.set(key, &envelope, tags).await;
                    self.l2_telemetry.record(start.elapsed(), result.is_ok());
                    if let Err(e) = result {
                        warn!(key = %key, layer = l2.name(), error = %e, "layer write failed");
                    }
                }
            };
            let l3_write = async {
                if let Some(l3) = &self.l3 {
                    let start = Instant::now();
                    let result = l3.set(key, &envelope, tags).await;
                    self.l3_telemetry.record(start.elapsed(), result.is_ok());
                    if let Err(e) = result {
                        warn!(key = %key, layer = l3.name(), error = %e, "layer write failed");
                    }
                }
            };
            futures::join!(l2_write, l3_write);
        }
    }

    /// Queues one remote write on the offload manager, bounded by the
    /// write limiter, with a single best-effort retry.
    fn dispatch_write<T>(
        &self,
        provider: Arc<dyn StorageProvider>,
        telemetry: &Arc<LayerTelemetry>,
        key: &CacheKey,
        envelope: &CacheValue<T>,
        tags: &[Tag],
    ) where
        T: Clone + Serialize + Send + Sync + 'static,
    {
        let limiter = Arc::clone(&self.write_limiter);
        let telemetry = Arc::clone(telemetry);
        let key = key.clone();
        let envelope = envelope.clone();
        let tags = tags.to_vec();
        self.offload.spawn("write-behind", async move {
            let Ok(_permit) = limiter.acquire().await else {
                return;
            };
            let start = Instant::now();
            let mut result = provider.set(&key, &envelope, &tags).await;
            if result.is_err() {
                tokio::time::sleep(ASYNC_WRITE_RETRY_DELAY).await;
                result = provider.set(&key, &envelope, &tags).await;
            }
            telemetry.record(start.elapsed(), result.is_ok());
            if let Err(e) = result {
                warn!(key = %key, layer = provider.name(), error = %e, "background write failed after retry");
            }
        });
    }

    /// Removes a key from every tier, then publishes the invalidation.
    pub async fn remove(&self, key: &CacheKey) {
        self.memory.remove(key);
        let l2_remove = async {
            if let Some(l2) = self.enabled_l2() {
                let start = Instant::now();
                let result = l2.remove(key).await;
                self.l2_telemetry.record(start.elapsed(), result.is_ok());
                if let Err(e) = result {
                    warn!(key = %key, layer = l2.name(), error = %e, "layer remove failed");
                }
            }
        };
        let l3_remove = async {
            if let Some(l3) = &self.l3 {
                let start = Instant::now();
                let result = l3.remove(key).await;
                self.l3_telemetry.record(start.elapsed(), result.is_ok());
                if let Err(e) = result {
                    warn!(key = %key, layer = l3.name(), error = %e, "layer remove failed");
                }
            }
        };
        futures::join!(l2_remove, l3_remove);

        if let Some(backplane) = self.enabled_backplane() {
            if let Err(e) = backplane.publish_invalidation(key).await {
                warn!(key = %key, error = %e, "backplane publish failed");
            }
        }
    }

    /// Removes every entry carrying `tag` from every tier, then publishes
    /// the tag invalidation.
    pub async fn remove_by_tag(&self, tag: &Tag) {
        self.memory.remove_by_tag(tag);
        let l2_remove = async {
            if let Some(l2) = self.enabled_l2() {
                let start = Instant::now();
                let result = l2.remove_by_tag(tag).await;
                self.l2_telemetry.record(start.elapsed(), result.is_ok());
                if let Err(e) = result {
                    warn!(tag = %tag, layer = l2.name(), error = %e, "layer tag removal failed");
                }
            }
        };
        let l3_remove = async {
            if let Some(l3) = &self.l3 {
                let start = Instant::now();
                let result = l3.remove_by_tag(tag).await;
                self.l3_telemetry.record(start.elapsed(), result.is_ok());
                if let Err(e) = result {
                    warn!(tag = %tag, layer = l3.name(), error = %e, "layer tag removal failed");
                }
            }
        };
        futures::join!(l2_remove, l3_remove);

        if let Some(backplane) = self.enabled_backplane() {
            if let Err(e) = backplane.publish_tag_invalidation(tag).await {
                warn!(tag = %tag, error = %e, "backplane publish failed");
            }
        }
    }

    /// Clears L1. Remote tiers have no clear in their contract; callers
    /// invalidate them by tag or key.
    pub fn clear_memory(&self) {
        self.memory.clear();
    }

    /// Aggregate health: strict worst-case over every enabled layer.
    pub async fn health(&self) -> HealthStatus {
        let mut health = HealthStatus::Healthy;
        if let Some(l2) = self.enabled_l2() {
            health = health.worst(l2.health().await);
        }
        if let Some(l3) = &self.l3 {
            health = health.worst(l3.health().await);
        }
        health
    }

    /// Per-layer statistics plus aggregated totals.
    pub async fn stats(&self) -> CacheStats {
        let mut layers = vec![self.memory.stats()];
        if let Some(l2) = self.enabled_l2() {
            let mut stats = match l2.stats().await {
                Ok(Some(stats)) => stats,
                _ => LayerStats {
                    name: l2.name().into(),
                    ..LayerStats::default()
                },
            };
            self.l2_telemetry.overlay(&mut stats);
            layers.push(stats);
        }
        if let Some(l3) = &self.l3 {
            let mut stats = match l3.stats().await {
                Ok(Some(stats)) => stats,
                _ => LayerStats {
                    name: l3.name().into(),
                    ..LayerStats::default()
                },
            };
            self.l3_telemetry.overlay(&mut stats);
            layers.push(stats);
        }
        let mut total = LayerStats {
            name: "total".into(),
            ..LayerStats::default()
        };
        for layer in &layers {
            total.merge(layer);
        }
        CacheStats { layers, total }
    }

    /// Two-phase shutdown: stop accepting work, drain background writes,
    /// then stop listeners. Safe to call concurrently with in-flight
    /// operations; safe to call twice.
    pub async fn shutdown(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown.send(true);
        if !self.offload.wait_all_timeout(SHUTDOWN_DRAIN_TIMEOUT).await {
            warn!("background tasks did not drain in time, aborting");
        }
        self.offload.cancel_all();
    }

    fn enabled_l2(&self) -> Option<&Arc<dyn StorageProvider>> {
        if self.options.l2_enabled {
            self.l2.as_ref()
        } else {
            None
        }
    }

    fn enabled_backplane(&self) -> Option<&Arc<dyn Backplane>> {
        if self.options.enable_backplane {
            self.backplane.as_ref()
        } else {
            None
        }
    }

    fn spawn_backplane_listener(self: &Arc<Self>) {
        let Some(backplane) = self.enabled_backplane().cloned() else {
            return;
        };
        let memory = Arc::clone(&self.memory);
        let own_id = self.options.instance_id.clone();
        let mut inbox = backplane.subscribe();
        let mut shutdown = self.shutdown.subscribe();
        self.offload.spawn("backplane-listener", async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    message = inbox.recv() => match message {
                        Ok(message) if message.origin == own_id => {
                            // Self-published: every shared tier is already
                            // consistent, nothing to do locally.
                        }
                        Ok(message) => {
                            debug!(origin = %message.origin, seq = message.seq, "applying backplane invalidation");
                            match message.invalidation {
                                Invalidation::Key(key) => {
                                    memory.remove(&key);
                                }
                                Invalidation::Tag(tag) => {
                                    memory.remove_by_tag(&tag);
                                }
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "backplane listener lagged, invalidations lost");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    fn spawn_sweeper(self: &Arc<Self>) {
        let memory = Arc::clone(&self.memory);
        let interval = self.options.sweep_interval;
        let mut shutdown = self.shutdown.subscribe();
        self.offload.spawn("sweeper", async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        memory.sweep_expired();
                    }
                }
            }
        });
    }
}

/// Builder for [`TieredCache`].
///
/// `build()` spawns the backplane listener and expiration sweeper, so it
/// must run inside a tokio runtime.
pub struct TieredCacheBuilder {
    options: CacheOptions,
    memory_config: Option<MemoryCacheConfig>,
    l2: Option<Arc<dyn StorageProvider>>,
    l3: Option<Arc<dyn PersistentStorage>>,
    backplane: Option<Arc<dyn Backplane>>,
    sweeper: bool,
}

impl TieredCacheBuilder {
    fn new() -> Self {
        TieredCacheBuilder {
            options: CacheOptions::default(),
            memory_config: None,
            l2: None,
            l3: None,
            backplane: None,
            sweeper: true,
        }
    }

    /// Sets the engine options.
    pub fn options(mut self, options: CacheOptions) -> Self {
        self.options = options;
        self
    }

    /// Overrides the L1 configuration (derived from the options when not
    /// set).
    pub fn memory(mut self, config: MemoryCacheConfig) -> Self {
        self.memory_config = Some(config);
        self
    }

    /// Plugs in the distributed (L2) provider.
    pub fn l2(mut self, provider: impl StorageProvider + 'static) -> Self {
        self.l2 = Some(Arc::new(provider));
        self
    }

    /// Plugs in the persistent (L3) provider.
    pub fn l3(mut self, provider: impl PersistentStorage + 'static) -> Self {
        self.l3 = Some(Arc::new(provider));
        self
    }

    /// Plugs in the invalidation backplane.
    pub fn backplane(mut self, backplane: impl Backplane + 'static) -> Self {
        self.backplane = Some(Arc::new(backplane));
        self
    }

    /// Enables or disables the background expiration sweeper. Required
    /// when refresh-ahead or sliding expiration is in play.
    pub fn sweeper(mut self, enabled: bool) -> Self {
        self.sweeper = enabled;
        self
    }

    /// Validates the options and assembles the pipeline.
    pub fn build(self) -> Result<Arc<TieredCache>, CacheError> {
        self.options.validate()?;
        let memory_config = self
            .memory_config
            .unwrap_or_else(|| MemoryCacheConfig::from(&self.options));
        let (shutdown, _) = watch::channel(false);
        let cache = Arc::new(TieredCache {
            memory: Arc::new(MemoryCache::new(memory_config)),
            l2: self.l2,
            l3: self.l3,
            backplane: self.backplane,
            options: Arc::new(self.options),
            offload: OffloadManager::new(),
            write_limiter: Arc::new(Semaphore::new(ASYNC_WRITE_CONCURRENCY)),
            l2_telemetry: Arc::new(LayerTelemetry::default()),
            l3_telemetry: Arc::new(LayerTelemetry::default()),
            shutdown,
            disposed: AtomicBool::new(false),
        });
        cache.spawn_backplane_listener();
        if self.sweeper {
            cache.spawn_sweeper();
        }
        Ok(cache)
    }
}

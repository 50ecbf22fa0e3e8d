//! The cache manager.
//!
//! [`CacheManager`] is what decorators call: it derives the cache key,
//! resolves the operation's policy, serves hits from the tiered pipeline,
//! and coalesces misses into single-flight factory runs with optional
//! distributed locking and refresh-ahead.
//!
//! `get_or_create` control flow:
//!
//! 1. Resolve the policy and derive the key.
//! 2. Try L1. On a hit, emit callbacks/metrics and return — scheduling a
//!    background refresh first when the entry is inside its refresh-ahead
//!    window.
//! 3. On a miss, enter the single-flight region. The lead caller rechecks
//!    the full pipeline (another caller may have populated it), optionally
//!    takes the distributed lock, runs the factory under the stampede
//!    deadline, writes through every tier, and broadcasts the value to
//!    every waiter.
//!
//! Factory failures propagate to all waiters and are never cached.
//! Coordinator write failures are logged and swallowed — the value has
//! already been computed and belongs to the caller.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;
use smol_str::SmolStr;
use tracing::{debug, warn};

use memotier_core::{
    CacheArg, CacheKey, CachePolicy, FastKeyGenerator, KeyGenerator, LockBehavior,
    ReadableKeyGenerator, Tag,
};

use crate::error::CacheError;
use crate::events::{CacheCallback, CacheEvent, CallbackRegistry};
use crate::flight::{FlightDecision, FlightFailure, FlightGroup};
use crate::lock::DistributedLock;
use crate::metrics::{MetricsSink, NoopSink};
use crate::registry::PolicyRegistry;
use crate::tiered::{CacheStats, TieredCache};

/// Marker trait for values the cache can hold.
///
/// Blanket-implemented; never implement it manually. `Clone` lets one
/// factory run serve every waiter, the serde bounds let the value travel
/// to out-of-process tiers.
pub trait CacheableValue:
    Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> CacheableValue for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Top-level cache entry point.
///
/// Construct through [`CacheManager::builder`]; the manager is an
/// `Arc`-shared process-wide singleton owned by the host's lifecycle.
pub struct CacheManager {
    tiers: Arc<TieredCache>,
    registry: Arc<PolicyRegistry>,
    flights: Arc<FlightGroup>,
    key_generators: HashMap<SmolStr, Arc<dyn KeyGenerator>>,
    default_generator: Arc<dyn KeyGenerator>,
    lock: Option<Arc<dyn DistributedLock>>,
    callbacks: Arc<CallbackRegistry>,
    metrics: Arc<dyn MetricsSink>,
    disposed: AtomicBool,
}

impl CacheManager {
    /// Creates a builder.
    pub fn builder() -> CacheManagerBuilder {
        CacheManagerBuilder::new()
    }

    /// The tiered pipeline underneath this manager.
    pub fn tiers(&self) -> &Arc<TieredCache> {
        &self.tiers
    }

    /// The policy registry (runtime overrides go through it).
    pub fn registry(&self) -> &Arc<PolicyRegistry> {
        &self.registry
    }

    /// Memoizes `factory` under a key derived from `method_id` and `args`.
    ///
    /// The full path: key generation, policy lookup, tiered read,
    /// single-flight factory execution, write-through, callbacks.
    pub async fn get_or_create<T, F, Fut, E>(
        &self,
        method_id: &str,
        args: &[CacheArg],
        factory: F,
    ) -> Result<T, CacheError>
    where
        T: CacheableValue,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>> + Send + 'static,
    {
        self.ensure_accepting()?;
        let resolution = self.registry.get_policy(method_id)?;
        let key = self.generate_key(method_id, args, &resolution.policy);
        self.get_or_create_fast(key, method_id, &resolution.policy, factory)
            .await
    }

    /// The full path with a pre-computed key and pre-resolved policy.
    ///
    /// Source-generated decorators resolve both at construction time and
    /// call this directly.
    pub async fn get_or_create_fast<T, F, Fut, E>(
        &self,
        key: CacheKey,
        method_id: &str,
        policy: &CachePolicy,
        factory: F,
    ) -> Result<T, CacheError>
    where
        T: CacheableValue,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>> + Send + 'static,
    {
        self.ensure_accepting()?;

        if let Some((value, meta)) = self.tiers.memory().get_with_meta::<T>(&key) {
            let fraction = policy
                .refresh_ahead
                .unwrap_or(self.tiers.options().refresh_ahead_fraction);
            if fraction > 0.0 && meta.remaining_fraction() < fraction {
                eprintln!("DEBUG: about to spawn_refresh, fraction={fraction} remaining={}", meta.remaining_fraction());
                self.spawn_refresh(key.clone(), method_id, policy, factory);
                eprintln!("DEBUG: spawn_refresh returned");
            }
            self.metrics.hit(method_id);
            self.callbacks.emit_hit(method_id, &key);
            return Ok(value);
        }

        self.load_through_flight(key, method_id, policy, factory)
            .await
    }

    /// Read-only lookup: never invokes a factory, never enters the
    /// single-flight region.
    pub async fn try_get<T>(
        &self,
        method_id: &str,
        args: &[CacheArg],
    ) -> Result<Option<T>, CacheError>
    where
        T: CacheableValue,
    {
        self.ensure_accepting()?;
        let resolution = self.registry.get_policy(method_id)?;
        let key = self.generate_key(method_id, args, &resolution.policy);
        let value = self.tiers.get::<T>(&key).await;
        match &value {
            Some(_) => {
                self.metrics.hit(method_id);
                self.callbacks.emit_hit(method_id, &key);
            }
            None => self.metrics.miss(method_id),
        }
        Ok(value)
    }

    /// Read-only lookup by pre-computed key, skipping key generation,
    /// policy lookup, and L1 observation (no statistics or access-order
    /// updates on the L1 probe).
    pub async fn try_get_fast<T>(&self, key: &CacheKey) -> Option<T>
    where
        T: CacheableValue,
    {
        if let Some(value) = self.tiers.memory().peek::<T>(key) {
            return Some(value);
        }
        self.tiers.get::<T>(key).await
    }

    /// Invalidates every entry carrying any of `tags`, across all tiers
    /// and instances. Never fails observably.
    pub async fn invalidate_by_tags(&self, tags: &[Tag]) {
        for tag in tags {
            self.tiers.remove_by_tag(tag).await;
        }
    }

    /// Invalidates the given keys across all tiers and instances. Never
    /// fails observably.
    pub async fn invalidate_by_keys(&self, keys: &[CacheKey]) {
        for key in keys {
            self.tiers.remove(key).await;
        }
    }

    /// Invalidates every locally known key matching a `*` glob pattern,
    /// across all tiers and instances. Never fails observably.
    pub async fn invalidate_by_pattern(&self, pattern: &str) {
        let regex = match glob_to_regex(pattern) {
            Ok(regex) => regex,
            Err(e) => {
                warn!(pattern, error = %e, "invalid invalidation pattern ignored");
                return;
            }
        };
        let matching: Vec<CacheKey> = self
            .tiers
            .memory()
            .keys()
            .into_iter()
            .filter(|key| regex.is_match(key.as_str()))
            .collect();
        debug!(pattern, count = matching.len(), "pattern invalidation");
        for key in matching {
            self.tiers.remove(&key).await;
        }
    }

    /// Pipeline statistics.
    pub async fn stats(&self) -> CacheStats {
        self.tiers.stats().await
    }

    /// Aggregate pipeline health.
    pub async fn health(&self) -> memotier_core::HealthStatus {
        self.tiers.health().await
    }

    /// Clears the local L1 tier.
    pub fn clear(&self) {
        self.tiers.clear_memory();
    }

    /// Stops accepting operations and shuts the pipeline down. Safe to
    /// call twice and concurrently with in-flight operations; those either
    /// complete normally or observe [`CacheError::ShuttingDown`].
    pub async fn shutdown(&self) {
        self.disposed.store(true, Ordering::Release);
        self.tiers.shutdown().await;
    }

    fn ensure_accepting(&self) -> Result<(), CacheError> {
        if self.disposed.load(Ordering::Acquire) || self.tiers.is_disposed() {
            return Err(CacheError::ShuttingDown);
        }
        Ok(())
    }

    fn generate_key(&self, method_id: &str, args: &[CacheArg], policy: &CachePolicy) -> CacheKey {
        let generator = policy
            .key_generator
            .as_ref()
            .and_then(|name| self.key_generators.get(name.as_str()))
            .unwrap_or(&self.default_generator);
        generator.generate(method_id, args, policy)
    }

    fn effective_ttl(&self, policy: &CachePolicy) -> Duration {
        policy
            .duration
            .or(self.tiers.options().default_duration)
            .unwrap_or(self.tiers.options().l2_default_expiration)
    }

    /// Miss path: join (or lead) the single-flight build for `key`.
    async fn load_through_flight<T, F, Fut, E>(
        &self,
        key: CacheKey,
        method_id: &str,
        policy: &CachePolicy,
        factory: F,
    ) -> Result<T, CacheError>
    where
        T: CacheableValue,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>> + Send + 'static,
    {
        let deadline = policy.stampede.timeout;
        let mut factory = Some(factory);
        loop {
            match self
                .flights
                .check(&key, policy.stampede.max_concurrent_builds)
            {
                FlightDecision::Lead(_permit) => {
                    // The lead branch always returns, so the factory is
                    // still available here.
                    let Some(factory) = factory.take() else {
                        return Err(CacheError::configuration(
                            "single-flight lead re-entered after consuming its factory",
                        ));
                    };
                    return self.build_as_lead(key, method_id, policy, factory).await;
                }
                FlightDecision::Wait(mut outcome) => {
                    match tokio::time::timeout(deadline, outcome.recv()).await {
                        Err(_elapsed) => {
                            self.metrics.error(method_id, "stampede-timeout");
                            return Err(CacheError::StampedeTimeout(deadline));
                        }
                        Ok(Ok(Ok(shared))) => match shared.downcast::<T>() {
                            Ok(value) => {
                                self.metrics.hit(method_id);
                                self.callbacks.emit_hit(method_id, &key);
                                return Ok((*value).clone());
                            }
                            // The key was rebuilt under a different type;
                            // retry as a fresh caller.
                            Err(_) => continue,
                        },
                        Ok(Ok(Err(failure))) => {
                            return Err(self.waiter_failure(method_id, &key, failure));
                        }
                        Ok(Err(tokio::sync::broadcast::error::RecvError::Closed)) => {
                            // The lead disappeared without resolving; the
                            // next caller (us) becomes the new lead.
                            self.flights.cleanup(&key);
                            continue;
                        }
                        Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(_))) => continue,
                    }
                }
            }
        }
    }

    fn waiter_failure(
        &self,
        method_id: &str,
        key: &CacheKey,
        failure: FlightFailure,
    ) -> CacheError {
        match failure {
            FlightFailure::Factory(error) => {
                self.metrics.error(method_id, "factory-failure");
                CacheError::Factory(error)
            }
            FlightFailure::Timeout(deadline) => {
                self.metrics.error(method_id, "stampede-timeout");
                CacheError::StampedeTimeout(deadline)
            }
            FlightFailure::LockUnavailable => {
                self.metrics.error(method_id, "lock-unavailable");
                CacheError::LockUnavailable { key: key.clone() }
            }
        }
    }

    /// Lead path: recheck the pipeline, take the distributed lock if the
    /// policy asks for one, run the factory, store, broadcast.
    async fn build_as_lead<T, F, Fut, E>(
        &self,
        key: CacheKey,
        method_id: &str,
        policy: &CachePolicy,
        factory: F,
    ) -> Result<T, CacheError>
    where
        T: CacheableValue,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>> + Send + 'static,
    {
        // Another caller may have populated the key while we raced for
        // the slot.
        if let Some(value) = self.tiers.get::<T>(&key).await {
            self.flights.resolve(&key, Arc::new(value.clone()));
            self.metrics.hit(method_id);
            self.callbacks.emit_hit(method_id, &key);
            return Ok(value);
        }

        if let (Some(lock), Some(lock_opts)) = (&self.lock, policy.lock.as_ref()) {
            let lock_key = CacheKey::new(format!("lock:{key}"));
            match lock.acquire(&lock_key, lock_opts).await {
                Ok(Some(lease)) => {
                    // The previous holder may have cached the value
                    // before releasing.
                    if let Some(value) = self.tiers.get::<T>(&key).await {
                        lease.release().await;
                        self.flights.resolve(&key, Arc::new(value.clone()));
                        self.metrics.hit(method_id);
                        self.callbacks.emit_hit(method_id, &key);
                        return Ok(value);
                    }
                    let result = self
                        .run_factory(&key, method_id, policy, factory, true)
                        .await;
                    lease.release().await;
                    result
                }
                Ok(None) | Err(_) => match lock_opts.on_unavailable {
                    LockBehavior::FallbackDirect => {
                        // Stampede fallback: compute without caching the
                        // result; waiters still share it.
                        debug!(key = %key, "lock unavailable, falling back to direct factory");
                        self.run_factory(&key, method_id, policy, factory, false)
                            .await
                    }
                    LockBehavior::Fail => {
                        self.flights.fail(&key, FlightFailure::LockUnavailable);
                        self.metrics.error(method_id, "lock-unavailable");
                        Err(CacheError::LockUnavailable { key })
                    }
                },
            }
        } else {
            self.run_factory(&key, method_id, policy, factory, true)
                .await
        }
    }

    /// Runs the factory under the stampede deadline; on success optionally
    /// writes through the pipeline, then broadcasts to waiters.
    async fn run_factory<T, F, Fut, E>(
        &self,
        key: &CacheKey,
        method_id: &str,
        policy: &CachePolicy,
        factory: F,
        store: bool,
    ) -> Result<T, CacheError>
    where
        T: CacheableValue,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let deadline = policy.stampede.timeout;
        let start = Instant::now();
        match tokio::time::timeout(deadline, factory()).await {
            Err(_elapsed) => {
                self.flights.fail(key, FlightFailure::Timeout(deadline));
                self.metrics.error(method_id, "stampede-timeout");
                Err(CacheError::StampedeTimeout(deadline))
            }
            Ok(Err(error)) => {
                let shared: Arc<dyn std::error::Error + Send + Sync> = Arc::from(error.into());
                self.flights
                    .fail(key, FlightFailure::Factory(Arc::clone(&shared)));
                self.metrics.error(method_id, "factory-failure");
                Err(CacheError::Factory(shared))
            }
            Ok(Ok(value)) => {
                let elapsed = start.elapsed();
                if store {
                    self.tiers
                        .set(
                            key,
                            &value,
                            self.effective_ttl(policy),
                            policy.sliding_expiration,
                            &policy.tags,
                        )
                        .await;
                }
                self.flights.resolve(key, Arc::new(value.clone()));
                self.metrics.miss(method_id);
                self.metrics.latency(method_id, elapsed);
                self.callbacks.emit_miss(method_id, key, elapsed);
                Ok(value)
            }
        }
    }

    /// Schedules an asynchronous refresh for a still-fresh entry. One
    /// pending refresh per key (offload dedup); the refresh shares the
    /// single-flight slot with foreground misses, so the two coalesce.
    fn spawn_refresh<T, F, Fut, E>(
        &self,
        key: CacheKey,
        method_id: &str,
        policy: &CachePolicy,
        factory: F,
    ) where
        T: CacheableValue,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>> + Send + 'static,
    {
        let tiers = Arc::clone(&self.tiers);
        let flights = Arc::clone(&self.flights);
        let metrics = Arc::clone(&self.metrics);
        let callbacks = Arc::clone(&self.callbacks);
        let policy = policy.clone();
        let method_id = SmolStr::new(method_id);
        let default_duration = self.tiers.options().default_duration;
        let fallback_duration = self.tiers.options().l2_default_expiration;
        let task_key = key.clone();
        self.tiers.offload().spawn_with_key(key, async move {
            match flights.check(&task_key, policy.stampede.max_concurrent_builds) {
                FlightDecision::Lead(_permit) => {
                    debug!(key = %task_key, "refresh-ahead recompute");
                    let start = Instant::now();
                    match tokio::time::timeout(policy.stampede.timeout, factory()).await {
                        Ok(Ok(value)) => {
                            let ttl = policy
                                .duration
                                .or(default_duration)
                                .unwrap_or(fallback_duration);
                            tiers
                                .set(
                                    &task_key,
                                    &value,
                                    ttl,
                                    policy.sliding_expiration,
                                    &policy.tags,
                                )
                                .await;
                            flights.resolve(&task_key, Arc::new(value));
                            metrics.latency(&method_id, start.elapsed());
                            callbacks.emit_miss(&method_id, &task_key, start.elapsed());
                        }
                        Ok(Err(error)) => {
                            let shared: Arc<dyn std::error::Error + Send + Sync> =
                                Arc::from(error.into());
                            warn!(key = %task_key, error = %shared, "refresh-ahead factory failed");
                            flights.fail(&task_key, FlightFailure::Factory(shared));
                            metrics.error(&method_id, "factory-failure");
                        }
                        Err(_elapsed) => {
                            warn!(key = %task_key, "refresh-ahead factory timed out");
                            flights
                                .fail(&task_key, FlightFailure::Timeout(policy.stampede.timeout));
                            metrics.error(&method_id, "stampede-timeout");
                        }
                    }
                }
                FlightDecision::Wait(_) => {
                    // A foreground miss is already rebuilding this key.
                }
            }
        });
    }
}

fn glob_to_regex(pattern: &str) -> Result<regex::Regex, regex::Error> {
    let mut source = String::with_capacity(pattern.len() + 8);
    source.push('^');
    for part in pattern.split('*') {
        source.push_str(&regex::escape(part));
        source.push_str(".*");
    }
    // One ".*" too many was appended after the last literal part.
    source.truncate(source.len() - 2);
    source.push('$');
    regex::Regex::new(&source)
}

/// Builder for [`CacheManager`].
pub struct CacheManagerBuilder {
    tiers: Option<Arc<TieredCache>>,
    registry: Option<Arc<PolicyRegistry>>,
    lock: Option<Arc<dyn DistributedLock>>,
    metrics: Arc<dyn MetricsSink>,
    callbacks: CallbackRegistry,
    key_generators: HashMap<SmolStr, Arc<dyn KeyGenerator>>,
    default_generator: Arc<dyn KeyGenerator>,
}

impl CacheManagerBuilder {
    fn new() -> Self {
        let fast: Arc<dyn KeyGenerator> = Arc::new(FastKeyGenerator);
        let readable: Arc<dyn KeyGenerator> = Arc::new(ReadableKeyGenerator);
        let mut key_generators = HashMap::new();
        key_generators.insert(SmolStr::new(fast.name()), Arc::clone(&fast));
        key_generators.insert(SmolStr::new(readable.name()), readable);
        CacheManagerBuilder {
            tiers: None,
            registry: None,
            lock: None,
            metrics: Arc::new(NoopSink),
            callbacks: CallbackRegistry::default(),
            key_generators,
            default_generator: fast,
        }
    }

    /// Sets the tiered pipeline. Required.
    pub fn tiers(mut self, tiers: Arc<TieredCache>) -> Self {
        self.tiers = Some(tiers);
        self
    }

    /// Sets the policy registry (defaults to an empty registry).
    pub fn registry(mut self, registry: impl Into<Arc<PolicyRegistry>>) -> Self {
        self.registry = Some(registry.into());
        self
    }

    /// Plugs in a distributed lock for policies that opt into one.
    pub fn lock(mut self, lock: impl DistributedLock + 'static) -> Self {
        self.lock = Some(Arc::new(lock));
        self
    }

    /// Sets the metrics sink (defaults to a no-op).
    pub fn metrics(mut self, sink: impl MetricsSink + 'static) -> Self {
        self.metrics = Arc::new(sink);
        self
    }

    /// Registers an on-hit callback.
    pub fn on_hit(mut self, callback: impl Fn(&CacheEvent<'_>) + Send + Sync + 'static) -> Self {
        self.callbacks.push_hit(Box::new(callback) as CacheCallback);
        self
    }

    /// Registers an on-miss callback (fires after a factory run).
    pub fn on_miss(mut self, callback: impl Fn(&CacheEvent<'_>) + Send + Sync + 'static) -> Self {
        self.callbacks.push_miss(Box::new(callback) as CacheCallback);
        self
    }

    /// Registers an additional key generator, addressable from policies
    /// by its [`name`](KeyGenerator::name).
    pub fn key_generator(mut self, generator: impl KeyGenerator + 'static) -> Self {
        let generator: Arc<dyn KeyGenerator> = Arc::new(generator);
        self.key_generators
            .insert(SmolStr::new(generator.name()), generator);
        self
    }

    /// Replaces the default key generator.
    pub fn default_key_generator(mut self, generator: impl KeyGenerator + 'static) -> Self {
        let generator: Arc<dyn KeyGenerator> = Arc::new(generator);
        self.key_generators
            .insert(SmolStr::new(generator.name()), Arc::clone(&generator));
        self.default_generator = generator;
        self
    }

    /// Builds the manager.
    pub fn build(self) -> Result<Arc<CacheManager>, CacheError> {
        let tiers = self
            .tiers
            .ok_or_else(|| CacheError::configuration("cache manager requires a tiered pipeline"))?;
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(PolicyRegistry::empty()));
        Ok(Arc::new(CacheManager {
            tiers,
            registry,
            flights: Arc::new(FlightGroup::new()),
            key_generators: self.key_generators,
            default_generator: self.default_generator,
            lock: self.lock,
            callbacks: Arc::new(self.callbacks),
            metrics: self.metrics,
            disposed: AtomicBool::new(false),
        }))
    }
}

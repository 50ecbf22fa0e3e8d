//! Storage provider contracts.
//!
//! Two levels of abstraction, mirrored across every tier:
//!
//! - [`StorageProvider`] — dyn-compatible raw-byte contract implemented by
//!   concrete backends (L2 distributed, L3 persistent).
//! - [`Storage`] — typed get/set layered on top via the provider's
//!   [`Format`], automatically implemented for every provider.
//!
//! Cancellation follows the idiomatic Rust model: every operation is a
//! future, and dropping it cancels the call at the next suspension point.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};

use memotier_core::{CacheKey, CacheValue, HealthStatus, LayerStats, Raw, Tag};

use crate::error::{BackendError, BackendResult};
use crate::format::{Format, FormatExt, MsgpackFormat};

/// Status of a delete operation.
#[derive(Debug, PartialEq, Eq)]
pub enum DeleteStatus {
    /// Record successfully deleted.
    ///
    /// The `u32` counts how many layers deleted the key; single providers
    /// always report `1`, the coordinator sums across tiers.
    Deleted(u32),

    /// Record was not found.
    Missing,
}

/// Type alias for a dynamically dispatched provider handle.
pub type SyncStorage = dyn StorageProvider + Send + Sync;

/// Raw entry returned by reads: the serialized value plus the tag
/// associations recorded at write time.
///
/// Returning tags with the value lets read-through warming preserve them,
/// so a copy warmed into an upper tier is still reachable by tag
/// invalidation.
#[derive(Debug, Clone)]
pub struct RawEntry {
    /// The serialized value with its expiration.
    pub value: CacheValue<Raw>,
    /// Tags recorded atomically with the value.
    pub tags: Vec<Tag>,
}

/// Raw-byte storage contract for out-of-process cache tiers.
///
/// Implement this to plug a distributed or durable store into the
/// pipeline. The trait operates on serialized [`CacheValue<Raw>`] payloads;
/// the typed surface is [`Storage`].
///
/// Tag associations are passed with every write so backends can record
/// them atomically with the value (a server-side script on stores that
/// support one). `remove_by_tag` must remove every key the backend has
/// associated with the tag.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Provider name for logs, metrics, and stats records.
    fn name(&self) -> &str;

    /// Read raw cached data by key.
    ///
    /// Returns `Ok(Some(entry))` on hit, `Ok(None)` on miss. Expired
    /// entries are a miss.
    async fn read(&self, key: &CacheKey) -> BackendResult<Option<RawEntry>>;

    /// Write raw data, recording the given tag associations atomically
    /// with the value.
    async fn write(&self, key: &CacheKey, value: CacheValue<Raw>, tags: &[Tag])
    -> BackendResult<()>;

    /// Remove data by key.
    async fn remove(&self, key: &CacheKey) -> BackendResult<DeleteStatus>;

    /// Remove every entry associated with `tag`. Returns the number of
    /// removed entries.
    async fn remove_by_tag(&self, tag: &Tag) -> BackendResult<u64>;

    /// Whether a live entry exists, without observing it (no access-order
    /// or sliding-window effects).
    async fn exists(&self, key: &CacheKey) -> BackendResult<bool>;

    /// Current provider health.
    async fn health(&self) -> HealthStatus;

    /// Point-in-time statistics, if the provider tracks any.
    async fn stats(&self) -> BackendResult<Option<LayerStats>>;

    /// Serialization format for cached values. Default: [`MsgpackFormat`].
    fn value_format(&self) -> &dyn Format {
        &MsgpackFormat
    }
}

#[async_trait]
impl<P: StorageProvider + ?Sized> StorageProvider for Arc<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn read(&self, key: &CacheKey) -> BackendResult<Option<RawEntry>> {
        (**self).read(key).await
    }

    async fn write(
        &self,
        key: &CacheKey,
        value: CacheValue<Raw>,
        tags: &[Tag],
    ) -> BackendResult<()> {
        (**self).write(key, value, tags).await
    }

    async fn remove(&self, key: &CacheKey) -> BackendResult<DeleteStatus> {
        (**self).remove(key).await
    }

    async fn remove_by_tag(&self, tag: &Tag) -> BackendResult<u64> {
        (**self).remove_by_tag(tag).await
    }

    async fn exists(&self, key: &CacheKey) -> BackendResult<bool> {
        (**self).exists(key).await
    }

    async fn health(&self) -> HealthStatus {
        (**self).health().await
    }

    async fn stats(&self) -> BackendResult<Option<LayerStats>> {
        (**self).stats().await
    }

    fn value_format(&self) -> &dyn Format {
        (**self).value_format()
    }
}

#[async_trait]
impl<P: StorageProvider + ?Sized> StorageProvider for Box<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn read(&self, key: &CacheKey) -> BackendResult<Option<RawEntry>> {
        (**self).read(key).await
    }

    async fn write(
        &self,
        key: &CacheKey,
        value: CacheValue<Raw>,
        tags: &[Tag],
    ) -> BackendResult<()> {
        (**self).write(key, value, tags).await
    }

    async fn remove(&self, key: &CacheKey) -> BackendResult<DeleteStatus> {
        (**self).remove(key).await
    }

    async fn remove_by_tag(&self, tag: &Tag) -> BackendResult<u64> {
        (**self).remove_by_tag(tag).await
    }

    async fn exists(&self, key: &CacheKey) -> BackendResult<bool> {
        (**self).exists(key).await
    }

    async fn health(&self) -> HealthStatus {
        (**self).health().await
    }

    async fn stats(&self) -> BackendResult<Option<LayerStats>> {
        (**self).stats().await
    }

    fn value_format(&self) -> &dyn Format {
        (**self).value_format()
    }
}

/// Typed storage operations layered over [`StorageProvider`].
///
/// Handles serialization through the provider's configured [`Format`].
/// A deserialization failure surfaces as [`BackendError::Format`]; the
/// coordinator treats it as a miss and evicts the corrupt entry.
pub trait Storage: StorageProvider {
    /// Retrieve and deserialize a value together with its recorded tags.
    fn get<T>(
        &self,
        key: &CacheKey,
    ) -> impl Future<Output = BackendResult<Option<(CacheValue<T>, Vec<Tag>)>>> + Send
    where
        T: DeserializeOwned + Send,
    {
        async move {
            match self.read(key).await? {
                Some(entry) => {
                    let RawEntry { value, tags } = entry;
                    let (meta, raw) = value.into_parts();
                    match self.value_format().deserialize_value::<T>(&raw) {
                        Ok(Some(data)) => Ok(Some((CacheValue::from_parts(meta, data), tags))),
                        Ok(None) => Ok(None),
                        Err(e) => Err(BackendError::Format(e)),
                    }
                }
                None => Ok(None),
            }
        }
    }

    /// Serialize and store a value with its tag associations.
    fn set<T>(
        &self,
        key: &CacheKey,
        value: &CacheValue<T>,
        tags: &[Tag],
    ) -> impl Future<Output = BackendResult<()>> + Send
    where
        T: Serialize + Send + Sync,
    {
        async move {
            let raw = self.value_format().serialize_value(value.data())?;
            self.write(key, CacheValue::new(raw, value.expire()), tags)
                .await
        }
    }
}

impl<P: StorageProvider + ?Sized> Storage for P {}

/// Durable (L3) storage contract.
///
/// Persistent tiers cannot rely on the store expiring entries for them, so
/// the contract adds explicit cleanup plus a size query for capacity
/// monitoring.
#[async_trait]
pub trait PersistentStorage: StorageProvider {
    /// Remove entries whose expiration has passed. Returns the number of
    /// reclaimed entries.
    async fn cleanup_expired(&self) -> BackendResult<u64>;

    /// Total size of stored payloads in bytes.
    async fn storage_size(&self) -> BackendResult<u64>;
}

#[async_trait]
impl<P: PersistentStorage + ?Sized> PersistentStorage for Arc<P> {
    async fn cleanup_expired(&self) -> BackendResult<u64> {
        (**self).cleanup_expired().await
    }

    async fn storage_size(&self) -> BackendResult<u64> {
        (**self).storage_size().await
    }
}

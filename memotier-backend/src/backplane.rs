//! Cross-instance invalidation channel.
//!
//! When one instance removes a key or invalidates a tag, every other
//! instance must drop its private L1 copy. The [`Backplane`] carries those
//! notifications. Delivery is at-least-once within a bounded lag; messages
//! carry the publisher's instance id so receivers can discard their own
//! publications (the publisher already wrote through every shared tier).
//!
//! [`BroadcastBackplane`] is the in-process implementation over
//! `tokio::sync::broadcast` — real for single-host multi-instance setups
//! and for tests; network implementations (pub/sub, polled tables,
//! streams) live outside this workspace.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use tokio::sync::broadcast;

use memotier_core::{CacheKey, Tag};

use crate::error::BackendResult;

/// What a backplane message invalidates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Invalidation {
    /// A single key.
    Key(CacheKey),
    /// Every key carrying a tag.
    Tag(Tag),
}

/// One cross-instance invalidation notification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackplaneMessage {
    /// The invalidation payload.
    pub invalidation: Invalidation,
    /// Instance id of the publisher, for self-loopback suppression.
    pub origin: SmolStr,
    /// Monotonic per-publisher sequence number.
    pub seq: u64,
}

/// Cross-instance invalidation contract.
#[async_trait]
pub trait Backplane: Send + Sync {
    /// This instance's identity, stamped on every published message.
    fn instance_id(&self) -> &str;

    /// Publishes a key invalidation.
    async fn publish_invalidation(&self, key: &CacheKey) -> BackendResult<()>;

    /// Publishes a tag invalidation.
    async fn publish_tag_invalidation(&self, tag: &Tag) -> BackendResult<()>;

    /// Subscribes to the inbound invalidation stream.
    ///
    /// The stream includes this instance's own publications; the receiver
    /// is responsible for dropping messages whose `origin` matches
    /// [`instance_id`](Backplane::instance_id).
    fn subscribe(&self) -> broadcast::Receiver<BackplaneMessage>;
}

#[async_trait]
impl<B: Backplane + ?Sized> Backplane for Arc<B> {
    fn instance_id(&self) -> &str {
        (**self).instance_id()
    }

    async fn publish_invalidation(&self, key: &CacheKey) -> BackendResult<()> {
        (**self).publish_invalidation(key).await
    }

    async fn publish_tag_invalidation(&self, tag: &Tag) -> BackendResult<()> {
        (**self).publish_tag_invalidation(tag).await
    }

    fn subscribe(&self) -> broadcast::Receiver<BackplaneMessage> {
        (**self).subscribe()
    }
}

/// In-process backplane over a shared broadcast channel.
///
/// Instances created through [`join`](BroadcastBackplane::join) share the
/// channel but publish under their own identity, which is exactly the
/// multi-instance topology on one host (or in one test).
pub struct BroadcastBackplane {
    instance_id: SmolStr,
    sender: broadcast::Sender<BackplaneMessage>,
    seq: AtomicU64,
}

impl BroadcastBackplane {
    const CHANNEL_CAPACITY: usize = 1024;

    /// Creates a backplane with a generated instance id.
    pub fn new() -> Self {
        Self::with_instance_id(uuid::Uuid::new_v4().to_string())
    }

    /// Creates a backplane with an explicit instance id.
    pub fn with_instance_id(instance_id: impl Into<SmolStr>) -> Self {
        let (sender, _) = broadcast::channel(Self::CHANNEL_CAPACITY);
        BroadcastBackplane {
            instance_id: instance_id.into(),
            sender,
            seq: AtomicU64::new(0),
        }
    }

    /// Creates another handle on the same channel under a different
    /// identity.
    pub fn join(&self, instance_id: impl Into<SmolStr>) -> Self {
        BroadcastBackplane {
            instance_id: instance_id.into(),
            sender: self.sender.clone(),
            seq: AtomicU64::new(0),
        }
    }

    fn publish(&self, invalidation: Invalidation) {
        let message = BackplaneMessage {
            invalidation,
            origin: self.instance_id.clone(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };
        // A send error only means no instance is listening right now.
        let _ = self.sender.send(message);
    }
}

impl Default for BroadcastBackplane {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backplane for BroadcastBackplane {
    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    async fn publish_invalidation(&self, key: &CacheKey) -> BackendResult<()> {
        self.publish(Invalidation::Key(key.clone()));
        Ok(())
    }

    async fn publish_tag_invalidation(&self, tag: &Tag) -> BackendResult<()> {
        self.publish(Invalidation::Tag(tag.clone()));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BackplaneMessage> {
        self.sender.subscribe()
    }
}

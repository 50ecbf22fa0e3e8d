//! Tag index: tag → keys and its inverse.
//!
//! Two flat concurrent maps rather than pointer cycles. The index weakly
//! references keys: an entry can leave the main map without the index
//! noticing, and readers reconcile (removing a key that is already gone is
//! a no-op). Total live associations are bounded by `max_mappings`; once
//! the bound is reached new associations are dropped — the entries still
//! cache, but tag invalidation will not find them.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use tracing::warn;

use memotier_core::{CacheKey, Tag};

pub(crate) struct TagIndex {
    by_tag: DashMap<Tag, HashSet<CacheKey>>,
    by_key: DashMap<CacheKey, Vec<Tag>>,
    mappings: AtomicUsize,
    max_mappings: usize,
}

impl TagIndex {
    pub(crate) fn new(max_mappings: usize) -> Self {
        TagIndex {
            by_tag: DashMap::new(),
            by_key: DashMap::new(),
            mappings: AtomicUsize::new(0),
            max_mappings,
        }
    }

    /// Replaces `key`'s tag set. Stale links from a previous value are
    /// removed first, then the new set is linked in both directions.
    pub(crate) fn link(&self, key: &CacheKey, tags: &[Tag]) {
        self.unlink(key);
        if tags.is_empty() {
            return;
        }
        let mut linked = Vec::with_capacity(tags.len());
        for tag in tags {
            if self.mappings.load(Ordering::Relaxed) >= self.max_mappings {
                warn!(
                    key = %key,
                    tag = %tag,
                    max = self.max_mappings,
                    "tag mapping bound reached, dropping association"
                );
                break;
            }
            let inserted = self
                .by_tag
                .entry(tag.clone())
                .or_default()
                .insert(key.clone());
            if inserted {
                self.mappings.fetch_add(1, Ordering::Relaxed);
                linked.push(tag.clone());
            }
        }
        if !linked.is_empty() {
            self.by_key.insert(key.clone(), linked);
        }
    }

    /// Drops every association of `key`.
    pub(crate) fn unlink(&self, key: &CacheKey) {
        let Some((_, tags)) = self.by_key.remove(key) else {
            return;
        };
        for tag in tags {
            let mut empty = false;
            if let Some(mut keys) = self.by_tag.get_mut(&tag) {
                if keys.remove(key) {
                    self.mappings.fetch_sub(1, Ordering::Relaxed);
                }
                empty = keys.is_empty();
            }
            if empty {
                self.by_tag.remove_if(&tag, |_, keys| keys.is_empty());
            }
        }
    }

    /// Snapshot of the keys currently carrying `tag`.
    pub(crate) fn keys_for(&self, tag: &Tag) -> Vec<CacheKey> {
        self.by_tag
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Live association count.
    pub(crate) fn mapping_count(&self) -> usize {
        self.mappings.load(Ordering::Relaxed)
    }

    pub(crate) fn clear(&self) {
        self.by_tag.clear();
        self.by_key.clear();
        self.mappings.store(0, Ordering::Relaxed);
    }
}

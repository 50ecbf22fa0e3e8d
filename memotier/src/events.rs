//! Hit/miss callback events.
//!
//! Hosts can observe cache outcomes without wiring a metrics backend:
//! register closures on the manager builder and they fire on every hit and
//! every computed miss.

use std::time::Duration;

use memotier_core::CacheKey;

/// One observable cache outcome.
#[derive(Debug)]
pub enum CacheEvent<'a> {
    /// A read was served from cache.
    Hit {
        /// Logical operation name.
        method_id: &'a str,
        /// The resolved cache key.
        key: &'a CacheKey,
    },
    /// A miss was computed by the factory and stored.
    Miss {
        /// Logical operation name.
        method_id: &'a str,
        /// The resolved cache key.
        key: &'a CacheKey,
        /// Wall-clock time the factory took.
        elapsed: Duration,
    },
}

/// Callback invoked with cache events.
pub type CacheCallback = Box<dyn Fn(&CacheEvent<'_>) + Send + Sync>;

/// Registered hit/miss callbacks.
#[derive(Default)]
pub(crate) struct CallbackRegistry {
    on_hit: Vec<CacheCallback>,
    on_miss: Vec<CacheCallback>,
}

impl CallbackRegistry {
    pub(crate) fn push_hit(&mut self, callback: CacheCallback) {
        self.on_hit.push(callback);
    }

    pub(crate) fn push_miss(&mut self, callback: CacheCallback) {
        self.on_miss.push(callback);
    }

    pub(crate) fn emit_hit(&self, method_id: &str, key: &CacheKey) {
        if self.on_hit.is_empty() {
            return;
        }
        let event = CacheEvent::Hit { method_id, key };
        for callback in &self.on_hit {
            callback(&event);
        }
    }

    pub(crate) fn emit_miss(&self, method_id: &str, key: &CacheKey, elapsed: Duration) {
        if self.on_miss.is_empty() {
            return;
        }
        let event = CacheEvent::Miss {
            method_id,
            key,
            elapsed,
        };
        for callback in &self.on_miss {
            callback(&event);
        }
    }
}

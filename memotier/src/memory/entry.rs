//! L1 cache entries.
//!
//! Entries store the live value as `Arc<dyn Any>` — values never serialize
//! inside the process — together with the access state the eviction
//! strategies read and write: last-access ticks, access count, and the
//! clock strategy's access bit. Expiration is an atomic epoch-millisecond
//! instant so sliding-window reads extend it lock-free.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use chrono::Utc;

use memotier_core::Tag;

/// Monotonic microseconds since the first call in this process.
///
/// Used for access ordering only; never crosses the process boundary.
pub(crate) fn ticks_now() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_micros() as u64
}

/// Current wall clock as epoch milliseconds.
pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Snapshot of an entry's timing, used for refresh-ahead decisions.
#[derive(Clone, Copy, Debug)]
pub struct EntryMeta {
    /// Time until the entry expires.
    pub remaining: Duration,
    /// The TTL the entry was stored with.
    pub original: Duration,
    /// Number of observing reads so far.
    pub access_count: u64,
}

impl EntryMeta {
    /// Remaining lifetime as a fraction of the original TTL, in `[0, 1]`.
    pub fn remaining_fraction(&self) -> f64 {
        if self.original.is_zero() {
            return 0.0;
        }
        (self.remaining.as_secs_f64() / self.original.as_secs_f64()).clamp(0.0, 1.0)
    }
}

pub(crate) struct Entry {
    value: Arc<dyn Any + Send + Sync>,
    /// Absolute expiration, epoch milliseconds. Atomic so sliding reads
    /// can push it forward without a lock.
    expire_at_ms: AtomicI64,
    ttl_ms: i64,
    sliding_ms: Option<i64>,
    last_access: AtomicU64,
    access_count: AtomicU64,
    access_bit: AtomicBool,
    tags: Vec<Tag>,
}

impl Entry {
    pub(crate) fn new(
        value: Arc<dyn Any + Send + Sync>,
        ttl: Duration,
        sliding: Option<Duration>,
        tags: Vec<Tag>,
    ) -> Self {
        let ttl_ms = ttl.as_millis().min(i64::MAX as u128) as i64;
        Entry {
            value,
            expire_at_ms: AtomicI64::new(now_ms().saturating_add(ttl_ms)),
            ttl_ms,
            sliding_ms: sliding.map(|s| s.as_millis().min(i64::MAX as u128) as i64),
            last_access: AtomicU64::new(ticks_now()),
            access_count: AtomicU64::new(0),
            access_bit: AtomicBool::new(false),
            tags,
        }
    }

    pub(crate) fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expire_at_ms.load(Ordering::Acquire)
    }

    /// Records one observing read: access ordering state plus, when a
    /// sliding window is configured, the expiration extension. The
    /// extension only moves the deadline forward.
    pub(crate) fn touch(&self, now_ms: i64) {
        self.last_access.store(ticks_now(), Ordering::Release);
        self.access_count.fetch_add(1, Ordering::Relaxed);
        self.access_bit.store(true, Ordering::Release);
        if let Some(sliding_ms) = self.sliding_ms {
            self.expire_at_ms
                .fetch_max(now_ms.saturating_add(sliding_ms), Ordering::AcqRel);
        }
    }

    /// Clears the clock access bit, returning its previous state. An entry
    /// whose bit was set gets a second chance; one whose bit was already
    /// clear is an eviction candidate.
    pub(crate) fn clear_access_bit(&self) -> bool {
        self.access_bit.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Acquire)
    }

    pub(crate) fn tags(&self) -> &[Tag] {
        &self.tags
    }

    pub(crate) fn meta(&self, now_ms: i64) -> EntryMeta {
        let remaining_ms = (self.expire_at_ms.load(Ordering::Acquire) - now_ms).max(0);
        EntryMeta {
            remaining: Duration::from_millis(remaining_ms as u64),
            original: Duration::from_millis(self.ttl_ms.max(0) as u64),
            access_count: self.access_count.load(Ordering::Relaxed),
        }
    }

    /// Clones the value out as `T`, or `None` on a type mismatch (the key
    /// was reused for a different type; callers treat it as a miss).
    pub(crate) fn value_cloned<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.value.downcast_ref::<T>().cloned()
    }
}

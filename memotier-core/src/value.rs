//! Cached value envelope with expiration metadata.
//!
//! [`CacheValue`] wraps data bound for (or read from) the out-of-process
//! tiers together with its absolute expiration instant. Absolute UTC
//! timestamps travel on the wire unchanged, so an entry written by one
//! instance expires at the same moment everywhere.

use chrono::{DateTime, Utc};
use std::mem::size_of;
use std::time::Duration;

use crate::Raw;

/// A cached value with its expiration instant.
///
/// An entry is observable iff `now < expire`; a `None` expiration means the
/// value lives until explicitly invalidated or evicted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheValue<T> {
    data: T,
    expire: Option<DateTime<Utc>>,
}

impl<T> CacheValue<T> {
    /// Wraps data with an absolute expiration instant.
    pub fn new(data: T, expire: Option<DateTime<Utc>>) -> Self {
        CacheValue { data, expire }
    }

    /// Wraps data expiring `ttl` from now.
    pub fn with_ttl(data: T, ttl: Duration) -> Self {
        let expire = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        CacheValue {
            data,
            expire: Some(expire),
        }
    }

    /// Returns a reference to the cached data.
    #[inline]
    pub fn data(&self) -> &T {
        &self.data
    }

    /// Returns the absolute expiration instant, if any.
    #[inline]
    pub fn expire(&self) -> Option<DateTime<Utc>> {
        self.expire
    }

    /// Consumes the envelope and returns the inner data.
    pub fn into_inner(self) -> T {
        self.data
    }

    /// Splits the envelope into metadata and data.
    pub fn into_parts(self) -> (CacheMeta, T) {
        (CacheMeta { expire: self.expire }, self.data)
    }

    /// Rebuilds an envelope from metadata and data.
    pub fn from_parts(meta: CacheMeta, data: T) -> Self {
        CacheValue {
            data,
            expire: meta.expire,
        }
    }

    /// Remaining time-to-live, or `None` when already expired or unbounded.
    pub fn ttl(&self) -> Option<Duration> {
        self.expire.and_then(|expire| {
            let remaining = expire.signed_duration_since(Utc::now());
            remaining.to_std().ok().filter(|d| !d.is_zero())
        })
    }

    /// Whether the value has passed its expiration instant.
    pub fn is_expired(&self) -> bool {
        self.expire.is_some_and(|expire| expire <= Utc::now())
    }

    /// Maps the data, keeping the metadata.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheValue<U> {
        CacheValue {
            data: f(self.data),
            expire: self.expire,
        }
    }
}

/// Expiration metadata without the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheMeta {
    /// When the cached data expires and stops being observable.
    pub expire: Option<DateTime<Utc>>,
}

impl CacheValue<Raw> {
    /// Estimated memory usage of this serialized value in bytes.
    pub fn memory_size(&self) -> usize {
        size_of::<Self>() + self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_reflects_remaining_time() {
        let value = CacheValue::with_ttl(1u32, Duration::from_secs(3600));
        let ttl = value.ttl().unwrap();
        assert!(ttl > Duration::from_secs(3590) && ttl <= Duration::from_secs(3600));
        assert!(!value.is_expired());
    }

    #[test]
    fn expired_value_has_no_ttl() {
        let past = Utc::now() - chrono::Duration::seconds(10);
        let value = CacheValue::new("stale", Some(past));
        assert!(value.is_expired());
        assert_eq!(value.ttl(), None);
    }

    #[test]
    fn unbounded_value_never_expires() {
        let value = CacheValue::new(7u8, None);
        assert!(!value.is_expired());
        assert_eq!(value.ttl(), None);
    }
}

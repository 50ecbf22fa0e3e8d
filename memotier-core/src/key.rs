//! Cache key and tag types.
//!
//! A [`CacheKey`] is the deterministic string every tier is indexed by. Keys
//! are produced by a [`KeyGenerator`](crate::keygen::KeyGenerator) from a
//! method id and its argument vector, or supplied pre-computed by generated
//! decorators. A [`Tag`] is a secondary label carried by entries to enable
//! bulk invalidation.
//!
//! ## Format
//!
//! Generated keys follow the format `{method_id}:{digest}` with an optional
//! `_v{version}` suffix when the owning policy carries a version:
//!
//! ```
//! use memotier_core::{CacheArg, CachePolicy, FastKeyGenerator, KeyGenerator};
//!
//! let keygen = FastKeyGenerator::default();
//! let key = keygen.generate("users.get", &[CacheArg::from(42i64)], &CachePolicy::default());
//! assert!(key.as_str().starts_with("users.get:"));
//! ```
//!
//! ## Performance
//!
//! Both types wrap [`SmolStr`]: strings up to 23 bytes are stored inline,
//! longer ones share an `Arc`, so cloning a key is O(1) either way. This
//! matters because keys are copied into the tag index, the single-flight
//! slot table, and backplane messages.

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::fmt;

/// A cache key identifying a cached entry across every tier.
///
/// Keys are opaque printable strings. Equality and hashing are plain string
/// semantics, which lets the key index concurrent maps directly.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(SmolStr);

impl CacheKey {
    /// Creates a key from any string-like value.
    pub fn new(key: impl Into<SmolStr>) -> Self {
        CacheKey(key.into())
    }

    /// Returns the key text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the estimated memory usage of this key in bytes.
    ///
    /// Inline strings (≤23 bytes) cost nothing beyond the struct itself;
    /// longer strings add their heap length.
    pub fn memory_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.0.len().saturating_sub(23)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        CacheKey(SmolStr::new(key))
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        CacheKey(SmolStr::from(key))
    }
}

impl From<SmolStr> for CacheKey {
    fn from(key: SmolStr) -> Self {
        CacheKey(key)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A secondary label attached to cache entries.
///
/// Tags group unrelated keys so they can be invalidated in one operation
/// (`remove_by_tag`). An entry may carry any number of tags; the tag index
/// maintains the tag → keys mapping.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(SmolStr);

impl Tag {
    /// Creates a tag from any string-like value.
    pub fn new(tag: impl Into<SmolStr>) -> Self {
        Tag(tag.into())
    }

    /// Returns the tag text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Tag {
    fn from(tag: &str) -> Self {
        Tag(SmolStr::new(tag))
    }
}

impl From<String> for Tag {
    fn from(tag: String) -> Self {
        Tag(SmolStr::from(tag))
    }
}

impl AsRef<str> for Tag {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

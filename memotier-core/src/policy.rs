//! Cache policies and priority-merged policy fragments.
//!
//! A [`CachePolicy`] is the immutable, fully resolved behavior of one cached
//! operation: duration, sliding expiration, refresh-ahead, tags, stampede
//! protection, distributed locking, and free-form metadata.
//!
//! Policies are assembled from [`PolicyFragment`]s contributed by multiple
//! configuration surfaces. Each fragment records *which* fields it sets in a
//! [`PolicyFields`] bitmask; merging applies fragments in ascending priority
//! order, overwriting field by field, with two exceptions: tags are unioned
//! and metadata entries merge with higher-priority keys winning. Every merge
//! step is recorded as a [`PolicyContribution`] for diagnostics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::BitOr;
use std::time::Duration;

use crate::key::Tag;

/// Bitmask recording which policy fields a fragment sets.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyFields(u16);

impl PolicyFields {
    /// Expiration duration.
    pub const DURATION: PolicyFields = PolicyFields(1);
    /// Sliding expiration window.
    pub const SLIDING_EXPIRATION: PolicyFields = PolicyFields(1 << 1);
    /// Refresh-ahead fraction.
    pub const REFRESH_AHEAD: PolicyFields = PolicyFields(1 << 2);
    /// Tag list.
    pub const TAGS: PolicyFields = PolicyFields(1 << 3);
    /// Key version.
    pub const VERSION: PolicyFields = PolicyFields(1 << 4);
    /// Key generator identity.
    pub const KEY_GENERATOR: PolicyFields = PolicyFields(1 << 5);
    /// Idempotency requirement flag.
    pub const IDEMPOTENCY: PolicyFields = PolicyFields(1 << 6);
    /// Stampede-protection options.
    pub const STAMPEDE: PolicyFields = PolicyFields(1 << 7);
    /// Distributed-lock options.
    pub const LOCK: PolicyFields = PolicyFields(1 << 8);
    /// Metadata map.
    pub const METADATA: PolicyFields = PolicyFields(1 << 9);

    const NAMES: [(PolicyFields, &'static str); 10] = [
        (Self::DURATION, "duration"),
        (Self::SLIDING_EXPIRATION, "sliding_expiration"),
        (Self::REFRESH_AHEAD, "refresh_ahead"),
        (Self::TAGS, "tags"),
        (Self::VERSION, "version"),
        (Self::KEY_GENERATOR, "key_generator"),
        (Self::IDEMPOTENCY, "idempotency"),
        (Self::STAMPEDE, "stampede"),
        (Self::LOCK, "lock"),
        (Self::METADATA, "metadata"),
    ];

    /// The empty mask.
    pub const fn empty() -> Self {
        PolicyFields(0)
    }

    /// Whether no fields are set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether all bits of `other` are set in `self`.
    pub const fn contains(self, other: PolicyFields) -> bool {
        self.0 & other.0 == other.0
    }

    /// Sets the bits of `other`.
    pub fn insert(&mut self, other: PolicyFields) {
        self.0 |= other.0;
    }
}

impl BitOr for PolicyFields {
    type Output = PolicyFields;

    fn bitor(self, rhs: PolicyFields) -> PolicyFields {
        PolicyFields(self.0 | rhs.0)
    }
}

impl fmt::Debug for PolicyFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                set.entry(&name);
            }
        }
        set.finish()
    }
}

/// Stampede-protection options: single-flight deadline and build fan-out.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StampedeOptions {
    /// Deadline for the single-flight factory run. Waiters observe a
    /// stampede timeout when it elapses.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// How many callers may build concurrently for the same key. One means
    /// strict single-flight.
    pub max_concurrent_builds: usize,
}

impl Default for StampedeOptions {
    fn default() -> Self {
        StampedeOptions {
            timeout: Duration::from_secs(30),
            max_concurrent_builds: 1,
        }
    }
}

/// Behavior when the distributed lock cannot be acquired in time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockBehavior {
    /// Invoke the factory directly without caching the result.
    #[default]
    FallbackDirect,
    /// Surface a lock-unavailable failure to the caller.
    Fail,
}

/// Distributed-lock options for cross-instance stampede protection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOptions {
    /// Lock lease: how long the holder may keep the lock.
    #[serde(with = "humantime_serde")]
    pub lease: Duration,
    /// Acquisition wait: how long a caller blocks for the lock.
    #[serde(with = "humantime_serde")]
    pub wait: Duration,
    /// Acquisition attempts within the wait window.
    pub retry: u32,
    /// What to do when the lock stays unavailable.
    #[serde(default)]
    pub on_unavailable: LockBehavior,
}

impl Default for LockOptions {
    fn default() -> Self {
        LockOptions {
            lease: Duration::from_secs(30),
            wait: Duration::from_secs(5),
            retry: 3,
            on_unavailable: LockBehavior::default(),
        }
    }
}

/// Fully resolved caching behavior for one operation.
///
/// Immutable once resolved: the registry replaces a method's policy
/// atomically instead of mutating it.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct CachePolicy {
    /// Time-to-live of cached results. `None` defers to the engine default.
    #[serde(default, with = "humantime_serde")]
    pub duration: Option<Duration>,
    /// Sliding window: each observing read pushes expiration out again.
    #[serde(default, with = "humantime_serde")]
    pub sliding_expiration: Option<Duration>,
    /// Refresh-ahead threshold as a fraction of the TTL in `[0, 1)`: once
    /// remaining/original drops below it, a background refresh is scheduled.
    #[serde(default)]
    pub refresh_ahead: Option<f64>,
    /// Ordered tags attached to every entry this policy governs.
    #[serde(default)]
    pub tags: Vec<Tag>,
    /// Key version; bumping it detaches new entries from old ones.
    #[serde(default)]
    pub version: Option<u32>,
    /// Identity of the key generator to use (registry lookup by name).
    #[serde(default)]
    pub key_generator: Option<SmolStr>,
    /// Whether the decorated operation must be idempotent to be cached.
    #[serde(default)]
    pub require_idempotent: bool,
    /// Single-flight stampede protection.
    #[serde(default)]
    pub stampede: StampedeOptions,
    /// Optional cross-instance locking.
    #[serde(default)]
    pub lock: Option<LockOptions>,
    /// Free-form metadata consumed by extension layers.
    #[serde(default)]
    pub metadata: BTreeMap<SmolStr, SmolStr>,
}

impl CachePolicy {
    /// Applies one fragment on top of this policy, overwriting exactly the
    /// fields the fragment declares. Tags union; metadata merges with the
    /// fragment's keys winning.
    pub fn apply(&mut self, fragment: &PolicyFragment) {
        let fields = fragment.fields;
        let from = &fragment.policy;
        if fields.contains(PolicyFields::DURATION) {
            self.duration = from.duration;
        }
        if fields.contains(PolicyFields::SLIDING_EXPIRATION) {
            self.sliding_expiration = from.sliding_expiration;
        }
        if fields.contains(PolicyFields::REFRESH_AHEAD) {
            self.refresh_ahead = from.refresh_ahead;
        }
        if fields.contains(PolicyFields::TAGS) {
            for tag in &from.tags {
                if !self.tags.contains(tag) {
                    self.tags.push(tag.clone());
                }
            }
        }
        if fields.contains(PolicyFields::VERSION) {
            self.version = from.version;
        }
        if fields.contains(PolicyFields::KEY_GENERATOR) {
            self.key_generator = from.key_generator.clone();
        }
        if fields.contains(PolicyFields::IDEMPOTENCY) {
            self.require_idempotent = from.require_idempotent;
        }
        if fields.contains(PolicyFields::STAMPEDE) {
            self.stampede = from.stampede.clone();
        }
        if fields.contains(PolicyFields::LOCK) {
            self.lock = from.lock.clone();
        }
        if fields.contains(PolicyFields::METADATA) {
            for (key, value) in &from.metadata {
                self.metadata.insert(key.clone(), value.clone());
            }
        }
    }
}

/// One configuration surface's partial policy: the values plus the mask of
/// fields actually set.
///
/// Built fluently; every setter records its field in the mask:
///
/// ```
/// use memotier_core::policy::PolicyFragment;
/// use std::time::Duration;
///
/// let fragment = PolicyFragment::new()
///     .duration(Duration::from_secs(60))
///     .tags(["users"]);
/// ```
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct PolicyFragment {
    /// Which fields of `policy` are meaningful.
    pub fields: PolicyFields,
    /// The partial policy values.
    pub policy: CachePolicy,
}

impl PolicyFragment {
    /// An empty fragment setting nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the expiration duration.
    pub fn duration(mut self, duration: Duration) -> Self {
        self.policy.duration = Some(duration);
        self.fields.insert(PolicyFields::DURATION);
        self
    }

    /// Sets the sliding expiration window.
    pub fn sliding_expiration(mut self, window: Duration) -> Self {
        self.policy.sliding_expiration = Some(window);
        self.fields.insert(PolicyFields::SLIDING_EXPIRATION);
        self
    }

    /// Sets the refresh-ahead fraction.
    pub fn refresh_ahead(mut self, fraction: f64) -> Self {
        self.policy.refresh_ahead = Some(fraction);
        self.fields.insert(PolicyFields::REFRESH_AHEAD);
        self
    }

    /// Adds tags (unioned on merge).
    pub fn tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Tag>,
    {
        self.policy.tags.extend(tags.into_iter().map(Into::into));
        self.fields.insert(PolicyFields::TAGS);
        self
    }

    /// Sets the key version.
    pub fn version(mut self, version: u32) -> Self {
        self.policy.version = Some(version);
        self.fields.insert(PolicyFields::VERSION);
        self
    }

    /// Selects a key generator by name.
    pub fn key_generator(mut self, name: impl Into<SmolStr>) -> Self {
        self.policy.key_generator = Some(name.into());
        self.fields.insert(PolicyFields::KEY_GENERATOR);
        self
    }

    /// Requires (or waives) operation idempotency.
    pub fn require_idempotent(mut self, required: bool) -> Self {
        self.policy.require_idempotent = required;
        self.fields.insert(PolicyFields::IDEMPOTENCY);
        self
    }

    /// Sets stampede-protection options.
    pub fn stampede(mut self, options: StampedeOptions) -> Self {
        self.policy.stampede = options;
        self.fields.insert(PolicyFields::STAMPEDE);
        self
    }

    /// Sets distributed-lock options.
    pub fn lock(mut self, options: LockOptions) -> Self {
        self.policy.lock = Some(options);
        self.fields.insert(PolicyFields::LOCK);
        self
    }

    /// Adds a metadata entry.
    pub fn metadata(mut self, key: impl Into<SmolStr>, value: impl Into<SmolStr>) -> Self {
        self.policy.metadata.insert(key.into(), value.into());
        self.fields.insert(PolicyFields::METADATA);
        self
    }
}

/// Audit record of one source's contribution to a resolved policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyContribution {
    /// Identity of the contributing source.
    pub source_id: SmolStr,
    /// Source priority at merge time (higher wins).
    pub priority: u32,
    /// Fields the source set.
    pub fields: PolicyFields,
    /// When the contribution was merged.
    pub at: DateTime<Utc>,
}

/// The outcome of resolving one method id: the merged policy and the
/// ordered contribution trail.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyResolution {
    /// The method this resolution belongs to.
    pub method_id: SmolStr,
    /// The merged policy.
    pub policy: CachePolicy,
    /// Contributions in ascending priority order.
    pub contributions: Vec<PolicyContribution>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_mask_tracks_setters() {
        let fragment = PolicyFragment::new()
            .duration(Duration::from_secs(60))
            .tags(["a"])
            .version(2);
        assert!(fragment.fields.contains(PolicyFields::DURATION));
        assert!(fragment.fields.contains(PolicyFields::TAGS));
        assert!(fragment.fields.contains(PolicyFields::VERSION));
        assert!(!fragment.fields.contains(PolicyFields::LOCK));
    }

    #[test]
    fn apply_overwrites_only_declared_fields() {
        let mut policy = CachePolicy {
            duration: Some(Duration::from_secs(60)),
            version: Some(1),
            ..CachePolicy::default()
        };
        policy.apply(&PolicyFragment::new().duration(Duration::from_secs(5)));
        assert_eq!(policy.duration, Some(Duration::from_secs(5)));
        assert_eq!(policy.version, Some(1));
    }

    #[test]
    fn tags_union_without_duplicates() {
        let mut policy = CachePolicy::default();
        policy.apply(&PolicyFragment::new().tags(["x", "y"]));
        policy.apply(&PolicyFragment::new().tags(["y", "z"]));
        let tags: Vec<&str> = policy.tags.iter().map(Tag::as_str).collect();
        assert_eq!(tags, ["x", "y", "z"]);
    }

    #[test]
    fn metadata_merges_with_later_fragment_winning() {
        let mut policy = CachePolicy::default();
        policy.apply(&PolicyFragment::new().metadata("region", "eu").metadata("team", "core"));
        policy.apply(&PolicyFragment::new().metadata("region", "us"));
        assert_eq!(policy.metadata.get("region").map(SmolStr::as_str), Some("us"));
        assert_eq!(policy.metadata.get("team").map(SmolStr::as_str), Some("core"));
    }

    #[test]
    fn fields_debug_lists_names() {
        let fields = PolicyFields::DURATION | PolicyFields::TAGS;
        let text = format!("{fields:?}");
        assert!(text.contains("duration"));
        assert!(text.contains("tags"));
    }
}

//! Engine configuration.

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::time::Duration;

use memotier_core::{LockOptions, StampedeOptions};

use crate::error::CacheError;
use crate::memory::EvictionPolicy;

/// Every option the engine recognizes.
///
/// Serde-visible with kebab-case names and humantime durations, so a host
/// can deserialize this straight from its own configuration layer:
///
/// ```
/// let options: memotier::CacheOptions = serde_json::from_str(
///     r#"{ "l1-max-expiration": "10m", "eviction-policy": "clock" }"#,
/// ).unwrap();
/// assert_eq!(options.l1_max_expiration, std::time::Duration::from_secs(600));
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CacheOptions {
    /// TTL used when a policy omits a duration. `None` falls back to
    /// [`l2_default_expiration`](Self::l2_default_expiration).
    #[serde(with = "humantime_serde")]
    pub default_duration: Option<Duration>,

    /// Floor used by L1 TTL clamping when a caller-supplied TTL exceeds
    /// the L1 ceiling.
    #[serde(with = "humantime_serde")]
    pub l1_default_expiration: Duration,

    /// Ceiling for L1 TTL clamping. Keeps an L1 entry from outliving its
    /// L2 twin by more than this bound.
    #[serde(with = "humantime_serde")]
    pub l1_max_expiration: Duration,

    /// Default L2 TTL.
    #[serde(with = "humantime_serde")]
    pub l2_default_expiration: Duration,

    /// Include L2 in the pipeline.
    pub l2_enabled: bool,

    /// Dispatch L2/L3 writes to background tasks instead of awaiting them.
    pub enable_async_l2_writes: bool,

    /// Publish and subscribe to cross-instance invalidations.
    pub enable_backplane: bool,

    /// This instance's identity for backplane self-loopback suppression.
    /// Generated when not set explicitly.
    pub instance_id: SmolStr,

    /// Maintain hit/miss/eviction counters on the hot path. Disabling
    /// removes the atomic traffic entirely.
    pub enable_statistics: bool,

    /// L1 eviction strategy.
    pub eviction_policy: EvictionPolicy,

    /// Probability that a read performs the precise access-order update
    /// under the probabilistic strategy. Must be in `(0, 1]`.
    pub lru_update_probability: f64,

    /// L1 entry count high-water mark; crossing it triggers eviction.
    pub max_entries: usize,

    /// Bound on live tag-to-key associations. Associations beyond the
    /// bound are dropped: entries still cache, but tag invalidation will
    /// not find them.
    pub max_tag_mappings: usize,

    /// When `false`, `remove_by_tag` clears the entire L1 instead of
    /// maintaining the tag index.
    pub efficient_tag_invalidation: bool,

    /// Default single-flight options for policies that set none.
    pub stampede_protection: StampedeOptions,

    /// Default distributed-lock options for policies that opt in without
    /// overriding them.
    pub distributed_lock: LockOptions,

    /// Default refresh-ahead fraction in `[0, 1)`; `0` disables
    /// refresh-ahead for policies that set none.
    pub refresh_ahead_fraction: f64,

    /// Interval of the background expiration sweeper.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        CacheOptions {
            default_duration: None,
            l1_default_expiration: Duration::from_secs(5 * 60),
            l1_max_expiration: Duration::from_secs(30 * 60),
            l2_default_expiration: Duration::from_secs(4 * 3600),
            l2_enabled: true,
            enable_async_l2_writes: false,
            enable_backplane: true,
            instance_id: SmolStr::from(uuid::Uuid::new_v4().to_string()),
            enable_statistics: true,
            eviction_policy: EvictionPolicy::default(),
            lru_update_probability: 0.01,
            max_entries: 100_000,
            max_tag_mappings: 10_000,
            efficient_tag_invalidation: true,
            stampede_protection: StampedeOptions::default(),
            distributed_lock: LockOptions::default(),
            refresh_ahead_fraction: 0.0,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl CacheOptions {
    /// Checks the options for contradictions. Fatal at startup only.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.l1_default_expiration > self.l1_max_expiration {
            return Err(CacheError::configuration(format!(
                "l1-default-expiration ({:?}) exceeds l1-max-expiration ({:?})",
                self.l1_default_expiration, self.l1_max_expiration
            )));
        }
        if !(self.lru_update_probability > 0.0 && self.lru_update_probability <= 1.0) {
            return Err(CacheError::configuration(format!(
                "lru-update-probability must be in (0, 1], got {}",
                self.lru_update_probability
            )));
        }
        if !(0.0..1.0).contains(&self.refresh_ahead_fraction) {
            return Err(CacheError::configuration(format!(
                "refresh-ahead-fraction must be in [0, 1), got {}",
                self.refresh_ahead_fraction
            )));
        }
        if self.max_entries == 0 {
            return Err(CacheError::configuration("max-entries must be positive"));
        }
        if self.stampede_protection.timeout.is_zero() {
            return Err(CacheError::configuration(
                "stampede-protection timeout must be positive",
            ));
        }
        if self.stampede_protection.max_concurrent_builds == 0 {
            return Err(CacheError::configuration(
                "stampede-protection max-concurrent-builds must be at least 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_and_match_the_documented_table() {
        let options = CacheOptions::default();
        options.validate().unwrap();
        assert_eq!(options.l1_default_expiration, Duration::from_secs(300));
        assert_eq!(options.l1_max_expiration, Duration::from_secs(1800));
        assert_eq!(options.l2_default_expiration, Duration::from_secs(14_400));
        assert!(options.l2_enabled);
        assert!(!options.enable_async_l2_writes);
        assert!(options.enable_backplane);
        assert!(options.enable_statistics);
        assert_eq!(options.eviction_policy, EvictionPolicy::Probabilistic);
        assert_eq!(options.lru_update_probability, 0.01);
        assert_eq!(options.max_tag_mappings, 10_000);
        assert!(options.efficient_tag_invalidation);
        assert_eq!(options.stampede_protection.timeout, Duration::from_secs(30));
        assert_eq!(options.distributed_lock.wait, Duration::from_secs(5));
        assert_eq!(options.distributed_lock.lease, Duration::from_secs(30));
        assert_eq!(options.refresh_ahead_fraction, 0.0);
    }

    #[test]
    fn instance_ids_are_generated_uniquely() {
        assert_ne!(
            CacheOptions::default().instance_id,
            CacheOptions::default().instance_id
        );
    }

    #[test]
    fn contradictory_clamps_are_rejected() {
        let options = CacheOptions {
            l1_default_expiration: Duration::from_secs(3600),
            l1_max_expiration: Duration::from_secs(60),
            ..CacheOptions::default()
        };
        assert!(matches!(
            options.validate(),
            Err(CacheError::Configuration(_))
        ));
    }

    #[test]
    fn out_of_range_probability_is_rejected() {
        let options = CacheOptions {
            lru_update_probability: 0.0,
            ..CacheOptions::default()
        };
        assert!(options.validate().is_err());
    }
}

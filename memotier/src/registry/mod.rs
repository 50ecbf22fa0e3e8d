//! Policy registry and resolver.
//!
//! The registry ingests a fixed, ordered set of [`PolicySource`]s at
//! startup, merges their fragments per method id by ascending priority
//! (tags union, metadata merges, everything else overwrites field by
//! field), validates the result, and caches `(policy, contributions)`
//! forever — until a runtime override invalidates exactly that method id.
//!
//! The resolver is pure: for a fixed set of fragments, resolving a method
//! id always produces the same policy.

mod sources;

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use smol_str::SmolStr;
use tracing::debug;

use memotier_core::{CachePolicy, PolicyContribution, PolicyFragment, PolicyResolution};

use crate::error::CacheError;

pub use sources::{PolicySource, RuntimeOverrides, StaticSource, priority};

/// Priority-merging policy registry.
pub struct PolicyRegistry {
    /// Startup sources in ascending priority order (stable for ties).
    sources: Vec<Arc<dyn PolicySource>>,
    overrides: Arc<RuntimeOverrides>,
    cache: DashMap<SmolStr, Arc<PolicyResolution>>,
    base: CachePolicy,
}

impl PolicyRegistry {
    /// Creates a registry builder.
    pub fn builder() -> PolicyRegistryBuilder {
        PolicyRegistryBuilder::new()
    }

    /// Creates an empty registry (every method resolves to the base
    /// policy until overrides arrive).
    pub fn empty() -> Self {
        PolicyRegistry {
            sources: Vec::new(),
            overrides: Arc::new(RuntimeOverrides::new()),
            cache: DashMap::new(),
            base: CachePolicy::default(),
        }
    }

    /// Resolves (and caches) the policy for `method_id`.
    pub fn get_policy(&self, method_id: &str) -> Result<Arc<PolicyResolution>, CacheError> {
        if let Some(cached) = self.cache.get(method_id) {
            return Ok(Arc::clone(&cached));
        }
        let resolution = Arc::new(self.resolve(method_id)?);
        self.cache
            .insert(SmolStr::new(method_id), Arc::clone(&resolution));
        Ok(resolution)
    }

    /// Resolves every method id any source knows about, for diagnostics.
    pub fn get_all_policies(&self) -> Result<Vec<Arc<PolicyResolution>>, CacheError> {
        let mut ids = BTreeSet::new();
        for source in &self.sources {
            ids.extend(source.method_ids());
        }
        ids.extend(self.overrides.method_ids());
        ids.iter().map(|id| self.get_policy(id)).collect()
    }

    /// Applies a runtime override, invalidating only `method_id`'s cached
    /// resolution. The merged result is validated before it takes effect.
    pub fn apply_override(
        &self,
        method_id: &str,
        fragment: PolicyFragment,
    ) -> Result<(), CacheError> {
        // Validate the would-be merge before committing the override.
        let mut candidate = self.resolve_without_override(method_id)?;
        candidate.apply(&fragment);
        validate_policy(method_id, &candidate)?;

        self.overrides.set(SmolStr::new(method_id), fragment);
        self.cache.remove(method_id);
        debug!(method_id, "runtime policy override applied");
        Ok(())
    }

    /// Removes a runtime override, invalidating only `method_id`'s cached
    /// resolution.
    pub fn remove_override(&self, method_id: &str) {
        self.overrides.remove(method_id);
        self.cache.remove(method_id);
    }

    fn resolve(&self, method_id: &str) -> Result<PolicyResolution, CacheError> {
        let mut policy = self.base.clone();
        let mut contributions = Vec::new();
        for source in &self.sources {
            Self::merge_from(&**source, method_id, &mut policy, &mut contributions);
        }
        Self::merge_from(&*self.overrides, method_id, &mut policy, &mut contributions);
        validate_policy(method_id, &policy)?;
        Ok(PolicyResolution {
            method_id: SmolStr::new(method_id),
            policy,
            contributions,
        })
    }

    fn resolve_without_override(&self, method_id: &str) -> Result<CachePolicy, CacheError> {
        let mut policy = self.base.clone();
        let mut contributions = Vec::new();
        for source in &self.sources {
            Self::merge_from(&**source, method_id, &mut policy, &mut contributions);
        }
        Ok(policy)
    }

    fn merge_from(
        source: &dyn PolicySource,
        method_id: &str,
        policy: &mut CachePolicy,
        contributions: &mut Vec<PolicyContribution>,
    ) {
        if let Some(fragment) = source.fragment(method_id) {
            policy.apply(&fragment);
            contributions.push(PolicyContribution {
                source_id: SmolStr::new(source.source_id()),
                priority: source.priority(),
                fields: fragment.fields,
                at: Utc::now(),
            });
        }
    }
}

fn validate_policy(method_id: &str, policy: &CachePolicy) -> Result<(), CacheError> {
    if let Some(fraction) = policy.refresh_ahead
        && !(0.0..1.0).contains(&fraction)
    {
        return Err(CacheError::configuration(format!(
            "`{method_id}`: refresh-ahead fraction must be in [0, 1), got {fraction}"
        )));
    }
    if policy.stampede.timeout.is_zero() {
        return Err(CacheError::configuration(format!(
            "`{method_id}`: stampede-protection timeout must be positive"
        )));
    }
    if policy.stampede.max_concurrent_builds == 0 {
        return Err(CacheError::configuration(format!(
            "`{method_id}`: stampede-protection max-concurrent-builds must be at least 1"
        )));
    }
    if let Some(lock) = &policy.lock {
        if lock.lease.is_zero() || lock.wait.is_zero() {
            return Err(CacheError::configuration(format!(
                "`{method_id}`: distributed-lock lease and wait must be positive"
            )));
        }
    }
    Ok(())
}

/// Builder ingesting the fixed source list.
pub struct PolicyRegistryBuilder {
    sources: Vec<Arc<dyn PolicySource>>,
    base: CachePolicy,
}

impl PolicyRegistryBuilder {
    fn new() -> Self {
        PolicyRegistryBuilder {
            sources: Vec::new(),
            base: CachePolicy::default(),
        }
    }

    /// Adds one policy source.
    pub fn source(mut self, source: impl PolicySource + 'static) -> Self {
        self.sources.push(Arc::new(source));
        self
    }

    /// Sets the base policy fragments merge on top of.
    pub fn base_policy(mut self, base: CachePolicy) -> Self {
        self.base = base;
        self
    }

    /// Builds the registry, validating every declared method id.
    ///
    /// A contradictory policy is a configuration error and fatal here, at
    /// startup — never later at lookup time.
    pub fn build(mut self) -> Result<PolicyRegistry, CacheError> {
        // Stable sort keeps insertion order for equal priorities.
        self.sources.sort_by_key(|source| source.priority());
        let registry = PolicyRegistry {
            sources: self.sources,
            overrides: Arc::new(RuntimeOverrides::new()),
            cache: DashMap::new(),
            base: self.base,
        };
        registry.get_all_policies()?;
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memotier_core::{PolicyFields, Tag};
    use std::time::Duration;

    fn registry_with(sources: Vec<StaticSource>) -> PolicyRegistry {
        let mut builder = PolicyRegistry::builder();
        for source in sources {
            builder = builder.source(source);
        }
        builder.build().unwrap()
    }

    #[test]
    fn higher_priority_overwrites_lower() {
        let registry = registry_with(vec![
            StaticSource::attributes().method(
                "m",
                PolicyFragment::new()
                    .duration(Duration::from_secs(60))
                    .tags(["x"]),
            ),
            StaticSource::config_file()
                .method("m", PolicyFragment::new().duration(Duration::from_secs(5))),
        ]);
        let resolution = registry.get_policy("m").unwrap();
        assert_eq!(resolution.policy.duration, Some(Duration::from_secs(5)));
        // Tags set by the lower-priority source survive.
        assert_eq!(resolution.policy.tags, vec![Tag::new("x")]);
    }

    #[test]
    fn contributions_are_recorded_in_priority_order() {
        let registry = registry_with(vec![
            StaticSource::config_file()
                .method("m", PolicyFragment::new().duration(Duration::from_secs(5))),
            StaticSource::attributes()
                .method("m", PolicyFragment::new().tags(["x"])),
        ]);
        let resolution = registry.get_policy("m").unwrap();
        let ids: Vec<&str> = resolution
            .contributions
            .iter()
            .map(|c| c.source_id.as_str())
            .collect();
        assert_eq!(ids, ["attributes", "config-file"]);
        assert!(resolution.contributions[0].fields.contains(PolicyFields::TAGS));
    }

    #[test]
    fn resolution_is_deterministic() {
        let registry = registry_with(vec![
            StaticSource::attributes().method(
                "m",
                PolicyFragment::new().duration(Duration::from_secs(60)).tags(["a", "b"]),
            ),
            StaticSource::builders().method("m", PolicyFragment::new().tags(["b", "c"])),
        ]);
        let first = registry.get_policy("m").unwrap().policy.clone();
        registry.cache.clear();
        let second = registry.get_policy("m").unwrap().policy.clone();
        assert_eq!(first, second);
    }

    #[test]
    fn override_invalidates_only_its_method() {
        let registry = registry_with(vec![
            StaticSource::attributes()
                .method("a", PolicyFragment::new().duration(Duration::from_secs(60)))
                .method("b", PolicyFragment::new().duration(Duration::from_secs(60))),
        ]);
        let a_before = registry.get_policy("a").unwrap();
        let b_before = registry.get_policy("b").unwrap();

        registry
            .apply_override("a", PolicyFragment::new().duration(Duration::from_secs(1)))
            .unwrap();

        let a_after = registry.get_policy("a").unwrap();
        let b_after = registry.get_policy("b").unwrap();
        assert_eq!(a_after.policy.duration, Some(Duration::from_secs(1)));
        assert!(!Arc::ptr_eq(&a_before, &a_after));
        assert!(Arc::ptr_eq(&b_before, &b_after));
    }

    #[test]
    fn invalid_override_is_rejected_without_taking_effect() {
        let registry = registry_with(vec![]);
        let err = registry
            .apply_override("m", PolicyFragment::new().refresh_ahead(1.5))
            .unwrap_err();
        assert!(matches!(err, CacheError::Configuration(_)));
        assert!(registry.get_policy("m").unwrap().policy.refresh_ahead.is_none());
    }

    #[test]
    fn contradictory_startup_policy_is_fatal() {
        let result = PolicyRegistry::builder()
            .source(
                StaticSource::attributes()
                    .method("m", PolicyFragment::new().refresh_ahead(2.0)),
            )
            .build();
        assert!(matches!(result, Err(CacheError::Configuration(_))));
    }

    #[test]
    fn unknown_methods_resolve_to_the_base_policy() {
        let registry = registry_with(vec![]);
        let resolution = registry.get_policy("anything").unwrap();
        assert_eq!(resolution.policy, CachePolicy::default());
        assert!(resolution.contributions.is_empty());
    }
}

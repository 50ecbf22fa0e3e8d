//! Policy sources.
//!
//! Each configuration surface is a [`PolicySource`]: it owns fragments for
//! some set of method ids and carries a priority. The registry merges
//! fragments in ascending priority order, so a higher-priority source
//! overwrites (field by field) everything below it.

use std::collections::HashMap;

use dashmap::DashMap;
use smol_str::SmolStr;

use memotier_core::PolicyFragment;

/// Canonical source priorities (higher wins).
pub mod priority {
    /// Attributes on declared operations.
    pub const ATTRIBUTES: u32 = 10;
    /// Programmatic fluent builders.
    pub const BUILDERS: u32 = 40;
    /// Configuration files.
    pub const CONFIG_FILE: u32 = 50;
    /// Runtime overrides.
    pub const RUNTIME_OVERRIDE: u32 = 100;
}

/// One configuration surface yielding per-method policy fragments.
pub trait PolicySource: Send + Sync {
    /// Stable identity recorded in contribution audits.
    fn source_id(&self) -> &str;

    /// Merge priority; higher overwrites lower.
    fn priority(&self) -> u32;

    /// The fragment this source contributes for `method_id`, if any.
    fn fragment(&self, method_id: &str) -> Option<PolicyFragment>;

    /// Every method id this source knows about (for diagnostics).
    fn method_ids(&self) -> Vec<SmolStr>;
}

/// Immutable source over a fixed fragment map.
///
/// Covers the three startup surfaces — attribute scans, fluent builders,
/// and pre-parsed configuration files — which differ only in identity and
/// priority once their fragments exist:
///
/// ```
/// use memotier::registry::StaticSource;
/// use memotier_core::PolicyFragment;
/// use std::time::Duration;
///
/// let source = StaticSource::attributes()
///     .method("users.get", PolicyFragment::new().duration(Duration::from_secs(60)));
/// ```
pub struct StaticSource {
    id: SmolStr,
    priority: u32,
    fragments: HashMap<SmolStr, PolicyFragment>,
}

impl StaticSource {
    /// A source with an explicit identity and priority.
    pub fn new(id: impl Into<SmolStr>, priority: u32) -> Self {
        StaticSource {
            id: id.into(),
            priority,
            fragments: HashMap::new(),
        }
    }

    /// The attribute-scan surface (priority 10).
    pub fn attributes() -> Self {
        Self::new("attributes", priority::ATTRIBUTES)
    }

    /// The fluent-builder surface (priority 40).
    pub fn builders() -> Self {
        Self::new("builders", priority::BUILDERS)
    }

    /// The configuration-file surface (priority 50). File parsing happens
    /// upstream; this source consumes the resulting fragments.
    pub fn config_file() -> Self {
        Self::new("config-file", priority::CONFIG_FILE)
    }

    /// Adds a fragment for one method id.
    pub fn method(mut self, method_id: impl Into<SmolStr>, fragment: PolicyFragment) -> Self {
        self.fragments.insert(method_id.into(), fragment);
        self
    }
}

impl PolicySource for StaticSource {
    fn source_id(&self) -> &str {
        &self.id
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn fragment(&self, method_id: &str) -> Option<PolicyFragment> {
        self.fragments.get(method_id).cloned()
    }

    fn method_ids(&self) -> Vec<SmolStr> {
        self.fragments.keys().cloned().collect()
    }
}

/// The mutable runtime-override surface (priority 100).
///
/// Mutations go through
/// [`PolicyRegistry::apply_override`](super::PolicyRegistry::apply_override)
/// so the affected method's cached resolution is invalidated atomically.
#[derive(Default)]
pub struct RuntimeOverrides {
    fragments: DashMap<SmolStr, PolicyFragment>,
}

impl RuntimeOverrides {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set(&self, method_id: SmolStr, fragment: PolicyFragment) {
        self.fragments.insert(method_id, fragment);
    }

    pub(crate) fn remove(&self, method_id: &str) {
        self.fragments.remove(method_id);
    }
}

impl PolicySource for RuntimeOverrides {
    fn source_id(&self) -> &str {
        "runtime-overrides"
    }

    fn priority(&self) -> u32 {
        priority::RUNTIME_OVERRIDE
    }

    fn fragment(&self, method_id: &str) -> Option<PolicyFragment> {
        self.fragments.get(method_id).map(|f| f.clone())
    }

    fn method_ids(&self) -> Vec<SmolStr> {
        self.fragments.iter().map(|e| e.key().clone()).collect()
    }
}

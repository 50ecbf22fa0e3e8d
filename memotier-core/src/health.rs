//! Layer health reporting.

use serde::{Deserialize, Serialize};

/// Health of a storage layer or of the whole pipeline.
///
/// Ordered from best to worst so aggregation is a plain `max`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// The layer is fully operational.
    Healthy,
    /// The layer is operational but impaired (slow, partially reachable).
    Degraded,
    /// The layer cannot serve requests.
    Unhealthy,
}

impl HealthStatus {
    /// Combines two reports, keeping the worse one.
    pub fn worst(self, other: HealthStatus) -> HealthStatus {
        self.max(other)
    }
}

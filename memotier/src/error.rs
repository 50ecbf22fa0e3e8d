//! Engine-level error taxonomy.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use memotier_backend::{BackendError, FormatError};
use memotier_core::CacheKey;

/// Errors surfaced by cache operations.
///
/// The manager swallows transient storage and deserialization failures on
/// the read path (they degrade to misses); what reaches callers is the
/// taxonomy below. Cache hits never fail; misses fail only when the
/// factory fails or a protection deadline is exceeded.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A storage layer call failed (timeout, connection, internal error).
    ///
    /// Surfaced only from explicit write/invalidate surfaces; reads treat
    /// layer failures as misses.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Value (de)serialization failed on a caller-facing set/get.
    #[error(transparent)]
    Format(#[from] FormatError),

    /// The single-flight factory did not complete within the policy's
    /// stampede-protection timeout. Every waiter observes this.
    #[error("factory did not complete within {0:?}")]
    StampedeTimeout(Duration),

    /// The factory failed. Propagated unchanged to every current waiter;
    /// the result is not cached and the next call re-enters the
    /// single-flight region.
    #[error("factory failed: {0}")]
    Factory(#[source] Arc<dyn std::error::Error + Send + Sync>),

    /// The distributed lock could not be acquired within its wait window
    /// and the policy forbids direct fallback.
    #[error("distributed lock unavailable for `{key}`")]
    LockUnavailable {
        /// The contended cache key.
        key: CacheKey,
    },

    /// The engine is disposing; new operations are rejected.
    #[error("cache is shutting down")]
    ShuttingDown,

    /// Invalid or contradictory policy/configuration, detected at
    /// registration. Fatal at startup only.
    #[error("invalid configuration: {0}")]
    Configuration(String),
}

impl CacheError {
    /// Shorthand for a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        CacheError::Configuration(message.into())
    }
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

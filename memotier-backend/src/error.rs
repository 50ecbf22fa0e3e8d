//! Error types for storage operations.

use thiserror::Error;

use crate::format::FormatError;

/// Error type for storage provider operations.
///
/// Categorizes failures so the coordinator can pick the right recovery:
/// connection problems are transient (skip the layer, treat reads as
/// misses), format problems point at a corrupt or incompatible entry.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Internal provider error, state or computation failure.
    ///
    /// Anything not related to network interaction.
    #[error(transparent)]
    Internal(Box<dyn std::error::Error + Send + Sync>),

    /// Network interaction error.
    ///
    /// Communication failures with remote providers (timeouts, refused
    /// connections, broken pipes).
    #[error(transparent)]
    Connection(Box<dyn std::error::Error + Send + Sync>),

    /// Serialization or deserialization error.
    #[error(transparent)]
    Format(#[from] FormatError),
}

impl BackendError {
    /// Whether retrying (or skipping the layer) is a sound recovery.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Connection(_))
    }
}

/// Result type for storage provider operations.
pub type BackendResult<T> = Result<T, BackendError>;

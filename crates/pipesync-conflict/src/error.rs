//! Error types for conflict handling

use thiserror::Error;

/// Errors from conflict detection and resolution
#[derive(Debug, Error)]
pub enum ConflictError {
    /// No conflict with the given identifier
    #[error("conflict not found: {0}")]
    NotFound(String),

    /// The conflict was already resolved; resolution is forward-only
    #[error("conflict already resolved: {0}")]
    AlreadyResolved(String),

    /// The entity the conflict refers to no longer exists locally
    #[error("entity not found for record: {0}")]
    EntityNotFound(String),

    /// The remote rejected the push-back or storage failed
    #[error("resolution failed: {0}")]
    ResolutionFailed(String),

    /// Unrecognized policy name in configuration
    #[error("unknown conflict policy: {0}")]
    UnknownPolicy(String),
}

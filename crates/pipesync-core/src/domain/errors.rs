//! Domain error types
//!
//! Errors raised by domain operations: validation failures, invalid
//! state transitions, and malformed opaque tokens.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid remote record identifier
    #[error("Invalid remote record ID: {0}")]
    InvalidRemoteId(String),

    /// A cursor token could not be decoded
    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    /// Invalid state transition attempt
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition {
        /// The current state
        from: String,
        /// The attempted target state
        to: String,
    },

    /// A change record payload was structurally unusable
    #[error("Malformed record {remote_id}: {reason}")]
    MalformedRecord {
        /// Remote record the payload belonged to
        remote_id: String,
        /// Why the payload was rejected
        reason: String,
    },

    /// Unknown field mapping version requested
    #[error("Unknown mapping version: {0}")]
    UnknownMappingVersion(u32),

    /// ID parsing error
    #[error("Invalid ID format: {0}")]
    InvalidId(String),

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

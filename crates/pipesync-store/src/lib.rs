//! SQLite persistence layer for Pipesync
//!
//! Implements the [`pipesync_core::ports::state_repository::IStateRepository`]
//! port:
//!
//! - [`pool`]: connection pool setup, WAL mode, schema migration
//! - [`repository`]: row mapping and the port implementation
//! - [`writer`]: the transactional chunk-commit path

pub mod pool;
pub mod repository;
pub mod writer;

pub use pool::DatabasePool;
pub use repository::SqliteStateRepository;

use thiserror::Error;

/// Errors from the persistence layer
#[derive(Debug, Error)]
pub enum StoreError {
    /// Could not open or create the database
    #[error("database connection failed: {0}")]
    ConnectionFailed(String),

    /// Schema migration failed
    #[error("database migration failed: {0}")]
    MigrationFailed(String),

    /// A stored row could not be mapped back to a domain type
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Underlying SQL error
    #[error("database query failed: {0}")]
    Query(#[from] sqlx::Error),
}

//! Conflict detection and resolution for Pipesync
//!
//! - [`detector`]: pure three-way classification of one remote change
//!   against the local copy and its last-synced snapshot
//! - [`policy`]: the configured default applied at detection time
//! - [`resolver`]: applies resolution strategies, including the remote
//!   push-back for local-wins and merged outcomes

pub mod detector;
pub mod error;
pub mod policy;
pub mod resolver;

pub use detector::{ChangeDetector, RecordChange};
pub use error::ConflictError;
pub use policy::ConflictPolicy;
pub use resolver::ConflictResolver;

//! Domain layer: entities, value objects, and domain errors
//!
//! Everything in this module is pure data and behavior; persistence and
//! remote-API concerns live behind the traits in [`crate::ports`].

pub mod audit;
pub mod checkpoint;
pub mod conflict;
pub mod cursor;
pub mod entity;
pub mod errors;
pub mod mapping;
pub mod newtypes;
pub mod scoring;
pub mod session;

pub use audit::{AuditAction, AuditEntry};
pub use checkpoint::Checkpoint;
pub use conflict::{Conflict, ResolutionStatus, ResolutionStrategy};
pub use cursor::{Cursor, CursorState};
pub use entity::{ChangeRecord, EntityStatus, LocalEntity};
pub use errors::DomainError;
pub use mapping::FieldMapping;
pub use newtypes::{AuditId, ConflictId, RemoteRecordId, SessionId};
pub use session::{SessionKind, SessionStatus, SyncPhase, SyncSession};

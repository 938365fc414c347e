//! Core domain logic for Pipesync
//!
//! This crate contains the domain entities, value objects, and port
//! definitions for the CRM record synchronization engine. It follows a
//! hexagonal architecture: the domain layer has no I/O dependencies, and
//! the `ports` module defines the traits that adapter crates (remote CRM
//! client, SQLite store) implement.

pub mod config;
pub mod domain;
pub mod ports;

pub use config::Config;
pub use domain::{
    audit::{AuditAction, AuditEntry},
    checkpoint::Checkpoint,
    conflict::{Conflict, ResolutionStatus, ResolutionStrategy},
    cursor::{Cursor, CursorState},
    entity::{ChangeRecord, EntityStatus, LocalEntity},
    mapping::FieldMapping,
    newtypes::{AuditId, ConflictId, RemoteRecordId, SessionId},
    session::{SessionKind, SessionStatus, SyncPhase, SyncSession},
};

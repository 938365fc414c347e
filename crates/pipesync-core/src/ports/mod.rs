//! Port definitions (hexagonal architecture)
//!
//! These traits are the boundaries between the domain and the outside
//! world. Adapter crates implement them; the engine depends only on the
//! traits, so every adapter can be swapped in tests for an in-memory fake.

pub mod remote_crm;
pub mod state_repository;

pub use remote_crm::{ChangePage, IRemoteCrm, RecordUpdate, UpdateOutcome};
pub use state_repository::{ChunkWrite, ConflictFilter, IStateRepository, RateBudgetSnapshot};

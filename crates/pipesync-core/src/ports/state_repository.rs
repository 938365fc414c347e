//! State repository port
//!
//! Persistence boundary for sessions, entities, conflicts, checkpoints, and
//! the audit log. The SQLite adapter implements it; the engine never issues
//! SQL itself.
//!
//! The one method with transactional semantics is [`IStateRepository::apply_chunk`]:
//! a chunk's entity writes, conflicts, audit entries, session counters, and
//! checkpoint land atomically or not at all.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::audit::AuditEntry;
use crate::domain::checkpoint::Checkpoint;
use crate::domain::conflict::{Conflict, ResolutionStatus};
use crate::domain::entity::LocalEntity;
use crate::domain::newtypes::{ConflictId, RemoteRecordId, SessionId};
use crate::domain::session::SyncSession;

/// Everything one committed chunk writes, applied in a single transaction
#[derive(Debug, Clone)]
pub struct ChunkWrite {
    /// Session with counters and cursor advanced past this chunk
    pub session: SyncSession,
    /// Entities to upsert (keyed by remote id)
    pub entities: Vec<LocalEntity>,
    /// Conflicts detected in this chunk
    pub conflicts: Vec<Conflict>,
    /// Audit entries for every mutation in this chunk
    pub audits: Vec<AuditEntry>,
    /// Checkpoint recording the resume position after this chunk
    pub checkpoint: Checkpoint,
}

/// Filter for conflict queries
#[derive(Debug, Clone, Default)]
pub struct ConflictFilter {
    /// Only conflicts in this resolution state
    pub resolution_status: Option<ResolutionStatus>,
    /// Only conflicts on this record
    pub remote_id: Option<RemoteRecordId>,
    /// Cap on returned rows
    pub limit: Option<u32>,
}

impl ConflictFilter {
    /// Filter selecting unresolved conflicts
    pub fn unresolved() -> Self {
        Self {
            resolution_status: Some(ResolutionStatus::Unresolved),
            ..Self::default()
        }
    }
}

/// Persisted call-rate budget state
///
/// Saved when the process shuts down mid-window and restored on start, so
/// a restart cannot mint a fresh budget the remote would not honor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateBudgetSnapshot {
    /// When the current window opened
    pub window_started_at: DateTime<Utc>,
    /// Calls consumed in the current window
    pub calls_used: u32,
}

/// Port for the local persistence layer
#[async_trait]
pub trait IStateRepository {
    // --- Sessions ---

    /// Inserts or updates a session
    async fn save_session(&self, session: &SyncSession) -> anyhow::Result<()>;

    /// Fetches a session by id
    async fn get_session(&self, id: &SessionId) -> anyhow::Result<Option<SyncSession>>;

    /// Returns the session currently running or pending, if any
    async fn find_active_session(&self) -> anyhow::Result<Option<SyncSession>>;

    /// Returns the most recently completed session, if any
    async fn latest_completed_session(&self) -> anyhow::Result<Option<SyncSession>>;

    // --- Entities ---

    /// Fetches an entity by remote id
    async fn get_entity(&self, remote_id: &RemoteRecordId) -> anyhow::Result<Option<LocalEntity>>;

    /// Inserts or updates an entity outside the chunk path (resolver writes)
    async fn save_entity(&self, entity: &LocalEntity) -> anyhow::Result<()>;

    /// Number of entities visible in active views (tombstones excluded)
    async fn count_active_entities(&self) -> anyhow::Result<u64>;

    /// Latest remote modification time across all stored entities
    ///
    /// Seeds the watermark for an incremental sync without a saved cursor.
    async fn max_remote_modified_at(&self) -> anyhow::Result<Option<DateTime<Utc>>>;

    // --- Conflicts ---

    /// Inserts or updates a conflict
    async fn save_conflict(&self, conflict: &Conflict) -> anyhow::Result<()>;

    /// Fetches a conflict by id
    async fn get_conflict(&self, id: &ConflictId) -> anyhow::Result<Option<Conflict>>;

    /// Lists conflicts matching the filter, newest first
    async fn list_conflicts(&self, filter: &ConflictFilter) -> anyhow::Result<Vec<Conflict>>;

    // --- Audit ---

    /// Appends an audit entry outside the chunk path
    async fn save_audit(&self, entry: &AuditEntry) -> anyhow::Result<()>;

    // --- Checkpoints ---

    /// Fetches the latest checkpoint for a session
    async fn get_checkpoint(&self, session_id: &SessionId) -> anyhow::Result<Option<Checkpoint>>;

    /// Applies one chunk atomically: entities, conflicts, audit entries,
    /// session counters, and checkpoint commit or roll back together
    async fn apply_chunk(&self, chunk: &ChunkWrite) -> anyhow::Result<()>;

    // --- Rate budget ---

    /// Persists the call-rate budget state
    async fn save_rate_budget(&self, snapshot: &RateBudgetSnapshot) -> anyhow::Result<()>;

    /// Loads the persisted call-rate budget state, if any
    async fn load_rate_budget(&self) -> anyhow::Result<Option<RateBudgetSnapshot>>;
}

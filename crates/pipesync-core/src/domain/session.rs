//! SyncSession domain entity
//!
//! A `SyncSession` tracks one run of the engine, full or incremental,
//! from creation through completion, failure, or cancellation. The engine
//! guarantees at most one session is in the `Running` state at any time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::cursor::Cursor;
use super::errors::DomainError;
use super::newtypes::SessionId;

/// Whether a session walks the whole remote collection or only changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// Export every record in the remote collection
    Full,
    /// Fetch only records modified since the last watermark
    Incremental,
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionKind::Full => write!(f, "full"),
            SessionKind::Incremental => write!(f, "incremental"),
        }
    }
}

/// Status of a sync session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created but not yet picked up by the worker
    Pending,
    /// The chunk loop is active (or was, if the process died)
    Running,
    /// All pages consumed and committed
    Completed,
    /// Aborted with an error; the last good checkpoint is preserved
    Failed(String),
    /// Cancelled cooperatively between chunks
    Cancelled,
}

impl SessionStatus {
    /// Returns true if the session is pending or running
    pub fn is_active(&self) -> bool {
        matches!(self, SessionStatus::Pending | SessionStatus::Running)
    }

    /// Returns true if the session has reached a terminal state
    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Pending => write!(f, "pending"),
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Failed(msg) => write!(f, "failed: {}", msg),
            SessionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Sub-phase of a running session's chunk loop
///
/// Transient state carried on progress events; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    /// Waiting on the rate budget and the remote page fetch
    Fetching,
    /// Running the diff/conflict detector over the fetched page
    Classifying,
    /// Applying the classified chunk in a local transaction
    Writing,
    /// Persisting the advanced cursor (same transaction as the chunk)
    Checkpointing,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncPhase::Fetching => write!(f, "fetching"),
            SyncPhase::Classifying => write!(f, "classifying"),
            SyncPhase::Writing => write!(f, "writing"),
            SyncPhase::Checkpointing => write!(f, "checkpointing"),
        }
    }
}

/// One run of the synchronization engine
///
/// Lifecycle: `pending → running → {completed, failed, cancelled}`.
/// A `running` session whose process terminated abnormally is recoverable:
/// on the next start the orchestrator finds it, validates its cursor, and
/// resumes from the last committed checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSession {
    /// Unique identifier for this session
    id: SessionId,
    /// Full or incremental
    kind: SessionKind,
    /// Current lifecycle state
    status: SessionStatus,
    /// When the session was created
    created_at: DateTime<Utc>,
    /// When the worker started the chunk loop (None while pending)
    started_at: Option<DateTime<Utc>>,
    /// When the session reached a terminal state
    completed_at: Option<DateTime<Utc>>,
    /// Resume position; advanced only through committed checkpoints
    cursor: Option<Cursor>,
    /// Total records the remote reported for this run, when known
    records_total: Option<u64>,
    /// Records classified and committed so far
    records_processed: u64,
    /// Remote API calls consumed by this session
    api_calls_made: u64,
    /// Per-record errors (malformed payloads); never abort the run
    record_errors: u64,
    /// Field-mapping version pinned at session start
    mapping_version: u32,
    /// Last error observed, retained when the session fails
    last_error: Option<String>,
}

impl SyncSession {
    /// Creates a new pending session
    pub fn new(kind: SessionKind, mapping_version: u32) -> Self {
        Self {
            id: SessionId::new(),
            kind,
            status: SessionStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            cursor: None,
            records_total: None,
            records_processed: 0,
            api_calls_made: 0,
            record_errors: 0,
            mapping_version,
            last_error: None,
        }
    }

    // --- Getters ---

    /// Returns the session's unique identifier
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns whether this is a full or incremental run
    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    /// Returns the current status
    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    /// Returns when the session was created
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns when the chunk loop started, if it has
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Returns when the session reached a terminal state, if it has
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    /// Returns the current resume cursor
    pub fn cursor(&self) -> Option<&Cursor> {
        self.cursor.as_ref()
    }

    /// Returns the remote-reported record total, when known
    pub fn records_total(&self) -> Option<u64> {
        self.records_total
    }

    /// Returns the number of records committed so far
    pub fn records_processed(&self) -> u64 {
        self.records_processed
    }

    /// Returns the number of remote API calls made
    pub fn api_calls_made(&self) -> u64 {
        self.api_calls_made
    }

    /// Returns the count of per-record errors
    pub fn record_errors(&self) -> u64 {
        self.record_errors
    }

    /// Returns the field-mapping version this session pinned
    pub fn mapping_version(&self) -> u32 {
        self.mapping_version
    }

    /// Returns the last error observed
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Returns true if the session is pending or running
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    // --- Transitions ---

    /// Transitions `pending → running` (or re-enters `running` on resume)
    pub fn start(&mut self) -> Result<(), DomainError> {
        match self.status {
            SessionStatus::Pending | SessionStatus::Running => {
                self.status = SessionStatus::Running;
                if self.started_at.is_none() {
                    self.started_at = Some(Utc::now());
                }
                Ok(())
            }
            ref other => Err(DomainError::InvalidTransition {
                from: other.to_string(),
                to: "running".to_string(),
            }),
        }
    }

    /// Transitions `running → completed`
    pub fn complete(&mut self) -> Result<(), DomainError> {
        match self.status {
            SessionStatus::Running => {
                self.status = SessionStatus::Completed;
                self.completed_at = Some(Utc::now());
                Ok(())
            }
            ref other => Err(DomainError::InvalidTransition {
                from: other.to_string(),
                to: "completed".to_string(),
            }),
        }
    }

    /// Transitions to `failed`, retaining the reason as `last_error`
    ///
    /// Allowed from any active state; a pending session can fail during
    /// resume validation before its loop ever starts.
    pub fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        self.last_error = Some(reason.clone());
        self.status = SessionStatus::Failed(reason);
        self.completed_at = Some(Utc::now());
    }

    /// Transitions to `cancelled`, preserving the last committed checkpoint
    pub fn cancel(&mut self) -> Result<(), DomainError> {
        match self.status {
            SessionStatus::Pending | SessionStatus::Running => {
                self.status = SessionStatus::Cancelled;
                self.completed_at = Some(Utc::now());
                Ok(())
            }
            ref other => Err(DomainError::InvalidTransition {
                from: other.to_string(),
                to: "cancelled".to_string(),
            }),
        }
    }

    // --- Progress bookkeeping ---

    /// Advances the cursor after a committed chunk
    pub fn advance_cursor(&mut self, cursor: Cursor) {
        self.cursor = Some(cursor);
    }

    /// Sets the initial cursor for the run
    pub fn set_cursor(&mut self, cursor: Cursor) {
        self.cursor = Some(cursor);
    }

    /// Records the remote-reported total, if the remote provided one
    pub fn set_records_total(&mut self, total: u64) {
        self.records_total = Some(total);
    }

    /// Adds committed records to the processed counter
    pub fn add_records_processed(&mut self, count: u64) {
        self.records_processed += count;
    }

    /// Counts one remote API call against this session
    pub fn record_api_call(&mut self) {
        self.api_calls_made += 1;
    }

    /// Counts one per-record error; does not affect the session status
    pub fn record_malformed(&mut self, reason: impl Into<String>) {
        self.record_errors += 1;
        self.last_error = Some(reason.into());
    }
}

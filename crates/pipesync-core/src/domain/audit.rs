//! Audit entry domain entities
//!
//! Immutable records of every mutation the engine applies: merges, conflict
//! detections, resolutions, and tombstones. Resolution entries carry the
//! previous and new field values so sync history can always be reconstructed
//! without rewriting it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::entity::FieldMap;
use super::newtypes::{AuditId, RemoteRecordId, SessionId};

/// Actions recorded in the audit log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// A sync session started
    SessionStarted,
    /// A sync session reached a terminal state
    SessionFinished,
    /// Remote values were applied to an entity (plain update or insert)
    RemoteApplied,
    /// Disjoint local and remote changes were auto-merged
    MergeApplied,
    /// A field-level conflict was detected
    ConflictDetected,
    /// A conflict was resolved
    ConflictResolved,
    /// A remotely deleted record was tombstoned
    Tombstoned,
    /// Local changes were pushed back to the remote
    PushedBack,
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuditAction::SessionStarted => "session_started",
            AuditAction::SessionFinished => "session_finished",
            AuditAction::RemoteApplied => "remote_applied",
            AuditAction::MergeApplied => "merge_applied",
            AuditAction::ConflictDetected => "conflict_detected",
            AuditAction::ConflictResolved => "conflict_resolved",
            AuditAction::Tombstoned => "tombstoned",
            AuditAction::PushedBack => "pushed_back",
        };
        write!(f, "{}", s)
    }
}

/// An immutable audit log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Unique identifier for this entry
    id: AuditId,
    /// When the action occurred
    timestamp: DateTime<Utc>,
    /// Session the action belonged to, if any
    session_id: Option<SessionId>,
    /// Record the action touched, if any
    remote_id: Option<RemoteRecordId>,
    /// What happened
    action: AuditAction,
    /// Who caused it ("engine", a policy name, or a user identity)
    actor: String,
    /// Field values before the action, when the action changed values
    previous_values: Option<FieldMap>,
    /// Field values after the action, when the action changed values
    new_values: Option<FieldMap>,
    /// Additional structured context
    details: Value,
}

impl AuditEntry {
    /// Creates a new audit entry for the given action and actor
    pub fn new(action: AuditAction, actor: impl Into<String>) -> Self {
        Self {
            id: AuditId::new(),
            timestamp: Utc::now(),
            session_id: None,
            remote_id: None,
            action,
            actor: actor.into(),
            previous_values: None,
            new_values: None,
            details: Value::Null,
        }
    }

    /// Associates the entry with a session
    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Associates the entry with a record
    pub fn with_record(mut self, remote_id: RemoteRecordId) -> Self {
        self.remote_id = Some(remote_id);
        self
    }

    /// Attaches before/after field values
    pub fn with_values(mut self, previous: FieldMap, new: FieldMap) -> Self {
        self.previous_values = Some(previous);
        self.new_values = Some(new);
        self
    }

    /// Attaches structured context
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    // --- Getters ---

    /// Returns the entry's identifier
    pub fn id(&self) -> &AuditId {
        &self.id
    }

    /// Returns when the action occurred
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Returns the associated session, if any
    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    /// Returns the associated record, if any
    pub fn remote_id(&self) -> Option<&RemoteRecordId> {
        self.remote_id.as_ref()
    }

    /// Returns the recorded action
    pub fn action(&self) -> AuditAction {
        self.action
    }

    /// Returns who caused the action
    pub fn actor(&self) -> &str {
        &self.actor
    }

    /// Returns the field values before the action
    pub fn previous_values(&self) -> Option<&FieldMap> {
        self.previous_values.as_ref()
    }

    /// Returns the field values after the action
    pub fn new_values(&self) -> Option<&FieldMap> {
        self.new_values.as_ref()
    }

    /// Returns the structured context
    pub fn details(&self) -> &Value {
        &self.details
    }
}

//! Local mirror entities and incoming change records
//!
//! [`LocalEntity`] is the locally stored copy of a remote CRM record. It
//! carries the current field values, the snapshot of the values at the last
//! successful sync (`base_fields`), and the bookkeeping timestamps the diff
//! detector compares. All writes to entities go through the engine's write
//! path; external subsystems read them but never mutate them directly.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::newtypes::{RemoteRecordId, SessionId};

/// Field name → value map, ordered for stable serialization
pub type FieldMap = BTreeMap<String, Value>;

/// Sync status of a local entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    /// Local and remote copies agree as of the last sync
    Synced,
    /// Local fields were edited since the last sync and await push-back
    PendingLocalChange,
    /// At least one field has an unresolved conflict
    Conflicted,
    /// The last write for this entity failed; details in the session errors
    Error,
    /// Deleted remotely; retained for the audit window, hidden from
    /// active views
    Tombstoned,
}

impl std::fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EntityStatus::Synced => "synced",
            EntityStatus::PendingLocalChange => "pending_local_change",
            EntityStatus::Conflicted => "conflicted",
            EntityStatus::Error => "error",
            EntityStatus::Tombstoned => "tombstoned",
        };
        write!(f, "{}", s)
    }
}

/// One remote record observed during a fetch page
///
/// Transient: consumed by the diff detector and not persisted beyond the
/// session's lifetime except when it produces a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// The CRM's identifier for the record
    pub remote_id: RemoteRecordId,
    /// Field values as reported by the remote (already field-mapped)
    pub payload: FieldMap,
    /// When the remote last modified this record
    pub remote_modified_at: DateTime<Utc>,
    /// Whether the remote reports this record as deleted
    pub deleted: bool,
    /// The session that fetched this record
    pub session_id: SessionId,
}

/// Locally stored mirror of a remote record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalEntity {
    /// The CRM's identifier; unique, and the idempotency key for writes
    remote_id: RemoteRecordId,
    /// Current local field values
    fields: FieldMap,
    /// Field values as of the last successful sync (three-way merge base)
    base_fields: FieldMap,
    /// When any local field was last modified
    local_modified_at: DateTime<Utc>,
    /// `remote_modified_at` of the last remote version we synced
    last_synced_remote_modified_at: Option<DateTime<Utc>>,
    /// When this entity last participated in a committed sync chunk
    last_synced_at: Option<DateTime<Utc>>,
    /// Current sync status
    status: EntityStatus,
    /// When the remote deletion was observed (tombstones only)
    tombstoned_at: Option<DateTime<Utc>>,
}

impl LocalEntity {
    /// Creates an entity from a remote record never seen before (pure insert)
    pub fn from_remote(
        remote_id: RemoteRecordId,
        fields: FieldMap,
        remote_modified_at: DateTime<Utc>,
        synced_at: DateTime<Utc>,
    ) -> Self {
        Self {
            remote_id,
            base_fields: fields.clone(),
            fields,
            local_modified_at: synced_at,
            last_synced_remote_modified_at: Some(remote_modified_at),
            last_synced_at: Some(synced_at),
            status: EntityStatus::Synced,
            tombstoned_at: None,
        }
    }

    /// Reconstructs an entity from persisted state
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        remote_id: RemoteRecordId,
        fields: FieldMap,
        base_fields: FieldMap,
        local_modified_at: DateTime<Utc>,
        last_synced_remote_modified_at: Option<DateTime<Utc>>,
        last_synced_at: Option<DateTime<Utc>>,
        status: EntityStatus,
        tombstoned_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            remote_id,
            fields,
            base_fields,
            local_modified_at,
            last_synced_remote_modified_at,
            last_synced_at,
            status,
            tombstoned_at,
        }
    }

    // --- Getters ---

    /// Returns the remote record identifier
    pub fn remote_id(&self) -> &RemoteRecordId {
        &self.remote_id
    }

    /// Returns the current local field values
    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }

    /// Returns the last-synced snapshot of the field values
    pub fn base_fields(&self) -> &FieldMap {
        &self.base_fields
    }

    /// Returns when any local field was last modified
    pub fn local_modified_at(&self) -> DateTime<Utc> {
        self.local_modified_at
    }

    /// Returns the remote modification time of the last synced version
    pub fn last_synced_remote_modified_at(&self) -> Option<DateTime<Utc>> {
        self.last_synced_remote_modified_at
    }

    /// Returns when this entity was last committed by a sync chunk
    pub fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        self.last_synced_at
    }

    /// Returns the entity's sync status
    pub fn status(&self) -> &EntityStatus {
        &self.status
    }

    /// Returns when the remote deletion was observed, for tombstones
    pub fn tombstoned_at(&self) -> Option<DateTime<Utc>> {
        self.tombstoned_at
    }

    /// Returns true if this entity is visible in active views
    pub fn is_active(&self) -> bool {
        !matches!(self.status, EntityStatus::Tombstoned)
    }

    // --- Change inspection ---

    /// Field names whose current value differs from the last-synced snapshot
    pub fn locally_changed_fields(&self) -> BTreeSet<String> {
        let mut changed: BTreeSet<String> = self
            .fields
            .iter()
            .filter(|(name, value)| self.base_fields.get(*name) != Some(value))
            .map(|(name, _)| name.clone())
            .collect();
        // Fields removed locally count as changed too
        for name in self.base_fields.keys() {
            if !self.fields.contains_key(name) {
                changed.insert(name.clone());
            }
        }
        changed
    }

    /// Returns true if local edits exist that postdate the last sync
    pub fn has_local_changes(&self) -> bool {
        match self.last_synced_at {
            Some(synced) => self.local_modified_at > synced,
            None => true,
        }
    }

    // --- Mutations (engine write path only) ---

    /// Records a local field edit routed through the engine's update path
    pub fn set_field(&mut self, name: impl Into<String>, value: Value, at: DateTime<Utc>) {
        self.fields.insert(name.into(), value);
        self.local_modified_at = at;
        if !matches!(self.status, EntityStatus::Conflicted) {
            self.status = EntityStatus::PendingLocalChange;
        }
    }

    /// Applies remote values for the given fields and refreshes sync
    /// bookkeeping. Fields not named are left untouched (conflicting fields
    /// stay pending resolution).
    pub fn apply_remote_fields(
        &mut self,
        updates: &FieldMap,
        remote_modified_at: DateTime<Utc>,
        synced_at: DateTime<Utc>,
    ) {
        for (name, value) in updates {
            self.fields.insert(name.clone(), value.clone());
            self.base_fields.insert(name.clone(), value.clone());
        }
        self.last_synced_remote_modified_at = Some(remote_modified_at);
        self.last_synced_at = Some(synced_at);
    }

    /// Updates sync bookkeeping without touching field values
    ///
    /// Used when only the local side changed: the remote version is
    /// acknowledged so the next diff does not re-classify it, but local
    /// data is never overwritten.
    pub fn acknowledge_remote(
        &mut self,
        remote_modified_at: DateTime<Utc>,
        synced_at: DateTime<Utc>,
    ) {
        self.last_synced_remote_modified_at = Some(remote_modified_at);
        self.last_synced_at = Some(synced_at);
    }

    /// Re-baselines the snapshot after local changes were pushed back
    pub fn mark_pushed(&mut self, synced_at: DateTime<Utc>) {
        self.base_fields = self.fields.clone();
        self.last_synced_at = Some(synced_at);
        self.status = EntityStatus::Synced;
    }

    /// Sets the status, used by the classifier/resolver
    pub fn set_status(&mut self, status: EntityStatus) {
        self.status = status;
    }

    /// Marks this entity as remotely deleted
    pub fn mark_tombstoned(&mut self, at: DateTime<Utc>) {
        self.status = EntityStatus::Tombstoned;
        self.tombstoned_at = Some(at);
    }
}

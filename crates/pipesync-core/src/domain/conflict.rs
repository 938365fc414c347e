//! Conflict domain entities
//!
//! A [`Conflict`] records a field-level divergence: both the local copy and
//! the remote record changed the same field(s) to different values since the
//! last sync. Conflicts are persisted, never silently dropped, and resolved
//! only through the resolver (which writes an immutable audit entry).

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entity::FieldMap;
use super::errors::DomainError;
use super::newtypes::{ConflictId, RemoteRecordId};

/// How a conflict should be resolved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "strategy", content = "values")]
pub enum ResolutionStrategy {
    /// Take the remote value for every conflicting field
    RemoteWins,
    /// Keep the local value for every conflicting field and push it back
    LocalWins,
    /// Apply caller-chosen values per field
    Merged(FieldMap),
}

impl std::fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolutionStrategy::RemoteWins => write!(f, "remote_wins"),
            ResolutionStrategy::LocalWins => write!(f, "local_wins"),
            ResolutionStrategy::Merged(_) => write!(f, "merged"),
        }
    }
}

/// Resolution state of a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    /// Awaiting manual or policy resolution
    Unresolved,
    /// Local values kept and pushed back
    ResolvedLocal,
    /// Remote values applied
    ResolvedRemote,
    /// Per-field values chosen by the resolver
    ResolvedMerged,
}

impl ResolutionStatus {
    /// Status that corresponds to applying the given strategy
    pub fn for_strategy(strategy: &ResolutionStrategy) -> Self {
        match strategy {
            ResolutionStrategy::RemoteWins => ResolutionStatus::ResolvedRemote,
            ResolutionStrategy::LocalWins => ResolutionStatus::ResolvedLocal,
            ResolutionStrategy::Merged(_) => ResolutionStatus::ResolvedMerged,
        }
    }
}

impl std::fmt::Display for ResolutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResolutionStatus::Unresolved => "unresolved",
            ResolutionStatus::ResolvedLocal => "resolved_local",
            ResolutionStatus::ResolvedRemote => "resolved_remote",
            ResolutionStatus::ResolvedMerged => "resolved_merged",
        };
        write!(f, "{}", s)
    }
}

/// A detected field-level divergence requiring resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    /// Unique identifier for this conflict
    id: ConflictId,
    /// The record both sides modified
    remote_id: RemoteRecordId,
    /// Names of the fields in conflict
    fields: BTreeSet<String>,
    /// Local values of the conflicting fields at detection time
    local_values: FieldMap,
    /// Remote values of the conflicting fields at detection time
    remote_values: FieldMap,
    /// When the local side last modified the record
    local_modified_at: DateTime<Utc>,
    /// When the remote side last modified the record
    remote_modified_at: DateTime<Utc>,
    /// When the divergence was detected
    detected_at: DateTime<Utc>,
    /// Current resolution state
    resolution_status: ResolutionStatus,
    /// Who resolved it (user name or policy identifier)
    resolved_by: Option<String>,
    /// When it was resolved
    resolved_at: Option<DateTime<Utc>>,
}

impl Conflict {
    /// Creates a new unresolved conflict
    pub fn new(
        remote_id: RemoteRecordId,
        local_values: FieldMap,
        remote_values: FieldMap,
        local_modified_at: DateTime<Utc>,
        remote_modified_at: DateTime<Utc>,
    ) -> Self {
        let fields = local_values.keys().cloned().collect();
        Self {
            id: ConflictId::new(),
            remote_id,
            fields,
            local_values,
            remote_values,
            local_modified_at,
            remote_modified_at,
            detected_at: Utc::now(),
            resolution_status: ResolutionStatus::Unresolved,
            resolved_by: None,
            resolved_at: None,
        }
    }

    /// Reconstructs a conflict from persisted state
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        id: ConflictId,
        remote_id: RemoteRecordId,
        local_values: FieldMap,
        remote_values: FieldMap,
        local_modified_at: DateTime<Utc>,
        remote_modified_at: DateTime<Utc>,
        detected_at: DateTime<Utc>,
        resolution_status: ResolutionStatus,
        resolved_by: Option<String>,
        resolved_at: Option<DateTime<Utc>>,
    ) -> Self {
        let fields = local_values.keys().cloned().collect();
        Self {
            id,
            remote_id,
            fields,
            local_values,
            remote_values,
            local_modified_at,
            remote_modified_at,
            detected_at,
            resolution_status,
            resolved_by,
            resolved_at,
        }
    }

    // --- Getters ---

    /// Returns the conflict's unique identifier
    pub fn id(&self) -> &ConflictId {
        &self.id
    }

    /// Returns the record both sides modified
    pub fn remote_id(&self) -> &RemoteRecordId {
        &self.remote_id
    }

    /// Returns the names of the conflicting fields
    pub fn fields(&self) -> &BTreeSet<String> {
        &self.fields
    }

    /// Returns the local values at detection time
    pub fn local_values(&self) -> &FieldMap {
        &self.local_values
    }

    /// Returns the remote values at detection time
    pub fn remote_values(&self) -> &FieldMap {
        &self.remote_values
    }

    /// Returns when the local side last modified the record
    pub fn local_modified_at(&self) -> DateTime<Utc> {
        self.local_modified_at
    }

    /// Returns when the remote side last modified the record
    pub fn remote_modified_at(&self) -> DateTime<Utc> {
        self.remote_modified_at
    }

    /// Returns when the divergence was detected
    pub fn detected_at(&self) -> DateTime<Utc> {
        self.detected_at
    }

    /// Returns the resolution state
    pub fn resolution_status(&self) -> ResolutionStatus {
        self.resolution_status
    }

    /// Returns who resolved the conflict, if resolved
    pub fn resolved_by(&self) -> Option<&str> {
        self.resolved_by.as_deref()
    }

    /// Returns when the conflict was resolved, if resolved
    pub fn resolved_at(&self) -> Option<DateTime<Utc>> {
        self.resolved_at
    }

    /// Returns true once a resolution has been applied
    pub fn is_resolved(&self) -> bool {
        !matches!(self.resolution_status, ResolutionStatus::Unresolved)
    }

    // --- Resolution ---

    /// The field values that applying `strategy` would write
    pub fn chosen_values(&self, strategy: &ResolutionStrategy) -> FieldMap {
        match strategy {
            ResolutionStrategy::RemoteWins => self.remote_values.clone(),
            ResolutionStrategy::LocalWins => self.local_values.clone(),
            ResolutionStrategy::Merged(values) => values.clone(),
        }
    }

    /// Marks the conflict resolved
    ///
    /// Resolution only moves state forward; resolving an already-resolved
    /// conflict is rejected so the audit trail stays unambiguous.
    pub fn resolve(
        &mut self,
        strategy: &ResolutionStrategy,
        resolved_by: impl Into<String>,
    ) -> Result<(), DomainError> {
        if self.is_resolved() {
            return Err(DomainError::InvalidTransition {
                from: self.resolution_status.to_string(),
                to: ResolutionStatus::for_strategy(strategy).to_string(),
            });
        }
        self.resolution_status = ResolutionStatus::for_strategy(strategy);
        self.resolved_by = Some(resolved_by.into());
        self.resolved_at = Some(Utc::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ts(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, secs).unwrap()
    }

    fn conflict() -> Conflict {
        let mut local = FieldMap::new();
        local.insert("stage".to_string(), json!("Proposal"));
        let mut remote = FieldMap::new();
        remote.insert("stage".to_string(), json!("Negotiation"));
        Conflict::new(
            RemoteRecordId::new("opp-1").unwrap(),
            local,
            remote,
            ts(10),
            ts(20),
        )
    }

    #[test]
    fn test_new_conflict_is_unresolved() {
        let c = conflict();
        assert!(!c.is_resolved());
        assert_eq!(c.resolution_status(), ResolutionStatus::Unresolved);
        assert!(c.fields().contains("stage"));
        assert_eq!(c.fields().len(), 1);
    }

    #[test]
    fn test_chosen_values_remote_wins() {
        let c = conflict();
        let chosen = c.chosen_values(&ResolutionStrategy::RemoteWins);
        assert_eq!(chosen["stage"], json!("Negotiation"));
    }

    #[test]
    fn test_chosen_values_local_wins() {
        let c = conflict();
        let chosen = c.chosen_values(&ResolutionStrategy::LocalWins);
        assert_eq!(chosen["stage"], json!("Proposal"));
    }

    #[test]
    fn test_chosen_values_merged() {
        let c = conflict();
        let mut merged = FieldMap::new();
        merged.insert("stage".to_string(), json!("Closed Won"));
        let chosen = c.chosen_values(&ResolutionStrategy::Merged(merged.clone()));
        assert_eq!(chosen, merged);
    }

    #[test]
    fn test_resolve_sets_status_and_actor() {
        let mut c = conflict();
        c.resolve(&ResolutionStrategy::RemoteWins, "ops@example.com")
            .unwrap();
        assert_eq!(c.resolution_status(), ResolutionStatus::ResolvedRemote);
        assert_eq!(c.resolved_by(), Some("ops@example.com"));
        assert!(c.resolved_at().is_some());
    }

    #[test]
    fn test_double_resolve_rejected() {
        let mut c = conflict();
        c.resolve(&ResolutionStrategy::LocalWins, "policy").unwrap();
        assert!(c.resolve(&ResolutionStrategy::RemoteWins, "user").is_err());
    }

    #[test]
    fn test_status_for_strategy() {
        assert_eq!(
            ResolutionStatus::for_strategy(&ResolutionStrategy::LocalWins),
            ResolutionStatus::ResolvedLocal
        );
        assert_eq!(
            ResolutionStatus::for_strategy(&ResolutionStrategy::Merged(FieldMap::new())),
            ResolutionStatus::ResolvedMerged
        );
    }

    #[test]
    fn test_serialization_roundtrip() {
        let c = conflict();
        let json = serde_json::to_string(&c).unwrap();
        let back: Conflict = serde_json::from_str(&json).unwrap();
        assert_eq!(c, back);
    }
}

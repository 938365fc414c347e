//! Three-way change classification
//!
//! Compares an incoming remote record against the local copy and the
//! last-synced snapshot to decide, per field, whether the remote change
//! applies cleanly, merges with disjoint local edits, or collides with
//! them. Pure logic: no I/O, no clock reads, so every case is unit-testable.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info};

use pipesync_core::domain::conflict::Conflict;
use pipesync_core::domain::entity::{ChangeRecord, EntityStatus, FieldMap, LocalEntity};

use crate::policy::ConflictPolicy;

/// Outcome of classifying one remote record
#[derive(Debug, Clone)]
pub enum RecordChange {
    /// Record never seen locally: store it as-is
    Insert(LocalEntity),
    /// Only the remote changed: all changed fields applied
    Update {
        entity: LocalEntity,
        applied_fields: BTreeSet<String>,
    },
    /// Nothing to apply (remote unchanged, or only local edits exist)
    BookkeepingOnly(LocalEntity),
    /// Disjoint local and remote edits merged without a conflict
    AutoMerge {
        entity: LocalEntity,
        applied_fields: BTreeSet<String>,
    },
    /// Same field(s) changed on both sides to different values
    ConflictDetected {
        entity: LocalEntity,
        conflict: Box<Conflict>,
        /// Non-conflicting remote fields that were still applied
        applied_fields: BTreeSet<String>,
    },
    /// Remote deletion observed: entity tombstoned
    Tombstone(LocalEntity),
    /// Deletion of a record we never stored; nothing to do
    Skip,
}

/// Classifies remote changes against local state
pub struct ChangeDetector {
    policy: ConflictPolicy,
}

impl ChangeDetector {
    pub fn new(policy: ConflictPolicy) -> Self {
        Self { policy }
    }

    /// Classifies one remote record
    ///
    /// `now` is the commit timestamp the caller will persist with; passing
    /// it in keeps classification deterministic.
    pub fn classify(
        &self,
        record: &ChangeRecord,
        existing: Option<&LocalEntity>,
        now: DateTime<Utc>,
    ) -> RecordChange {
        let Some(existing) = existing else {
            if record.deleted {
                debug!(remote_id = %record.remote_id, "deletion of unknown record, skipping");
                return RecordChange::Skip;
            }
            return RecordChange::Insert(LocalEntity::from_remote(
                record.remote_id.clone(),
                record.payload.clone(),
                record.remote_modified_at,
                now,
            ));
        };

        let mut entity = existing.clone();

        if record.deleted {
            entity.acknowledge_remote(record.remote_modified_at, now);
            entity.mark_tombstoned(now);
            return RecordChange::Tombstone(entity);
        }

        // Fields the remote changed relative to the last-synced snapshot
        let remote_changed: BTreeSet<String> = record
            .payload
            .iter()
            .filter(|(name, value)| entity.base_fields().get(*name) != Some(value))
            .map(|(name, _)| name.clone())
            .collect();

        if remote_changed.is_empty() {
            entity.acknowledge_remote(record.remote_modified_at, now);
            return RecordChange::BookkeepingOnly(entity);
        }

        let local_changed = entity.locally_changed_fields();

        // A field both sides changed is only a conflict if they disagree on
        // the value; convergent edits apply cleanly.
        let conflict_fields: BTreeSet<String> = remote_changed
            .iter()
            .filter(|name| {
                local_changed.contains(*name)
                    && entity.fields().get(*name) != record.payload.get(*name)
            })
            .cloned()
            .collect();

        let applied_fields: BTreeSet<String> = remote_changed
            .difference(&conflict_fields)
            .cloned()
            .collect();
        let applied: FieldMap = applied_fields
            .iter()
            .filter_map(|name| record.payload.get(name).map(|v| (name.clone(), v.clone())))
            .collect();
        entity.apply_remote_fields(&applied, record.remote_modified_at, now);

        if conflict_fields.is_empty() {
            if local_changed.is_empty() {
                return RecordChange::Update {
                    entity,
                    applied_fields,
                };
            }
            debug!(
                remote_id = %record.remote_id,
                applied = applied_fields.len(),
                kept_local = local_changed.len(),
                "disjoint changes merged"
            );
            return RecordChange::AutoMerge {
                entity,
                applied_fields,
            };
        }

        let local_values: FieldMap = conflict_fields
            .iter()
            .map(|name| {
                (
                    name.clone(),
                    entity.fields().get(name).cloned().unwrap_or(Value::Null),
                )
            })
            .collect();
        let remote_values: FieldMap = conflict_fields
            .iter()
            .map(|name| {
                (
                    name.clone(),
                    record.payload.get(name).cloned().unwrap_or(Value::Null),
                )
            })
            .collect();

        info!(
            remote_id = %record.remote_id,
            fields = ?conflict_fields,
            policy = ?self.policy,
            "field-level conflict detected"
        );

        let mut conflict = Conflict::new(
            record.remote_id.clone(),
            local_values,
            remote_values.clone(),
            entity.local_modified_at(),
            record.remote_modified_at,
        );

        match self.policy.auto_strategy() {
            None => {
                entity.set_status(EntityStatus::Conflicted);
            }
            Some(strategy) => {
                let chosen = conflict.chosen_values(&strategy);
                // Fresh conflict: resolve cannot fail
                let _ = conflict.resolve(&strategy, self.policy.actor());
                match self.policy {
                    ConflictPolicy::RemoteWins => {
                        entity.apply_remote_fields(&chosen, record.remote_modified_at, now);
                        // Resolution may have consumed the last pending edit
                        if entity.locally_changed_fields().is_empty() {
                            entity.set_status(EntityStatus::Synced);
                        }
                    }
                    // Local values stand; the engine pushes them back
                    ConflictPolicy::LocalWins | ConflictPolicy::ManualOnly => {}
                }
            }
        }

        RecordChange::ConflictDetected {
            entity,
            conflict: Box::new(conflict),
            applied_fields,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pipesync_core::domain::conflict::ResolutionStatus;
    use pipesync_core::domain::newtypes::{RemoteRecordId, SessionId};
    use serde_json::json;

    fn ts(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
            + chrono::Duration::seconds(i64::from(secs))
    }

    fn fields(pairs: &[(&str, Value)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn base_entity() -> LocalEntity {
        LocalEntity::from_remote(
            RemoteRecordId::new("opp-1").unwrap(),
            fields(&[("stage", json!("Proposal")), ("amount", json!(1000))]),
            ts(0),
            ts(1),
        )
    }

    fn record(payload: FieldMap, deleted: bool) -> ChangeRecord {
        ChangeRecord {
            remote_id: RemoteRecordId::new("opp-1").unwrap(),
            payload,
            remote_modified_at: ts(50),
            deleted,
            session_id: SessionId::new(),
        }
    }

    fn detector() -> ChangeDetector {
        ChangeDetector::new(ConflictPolicy::ManualOnly)
    }

    #[test]
    fn test_unknown_record_is_insert() {
        let rec = record(fields(&[("stage", json!("Won"))]), false);
        match detector().classify(&rec, None, ts(60)) {
            RecordChange::Insert(entity) => {
                assert_eq!(entity.fields()["stage"], json!("Won"));
                assert_eq!(*entity.status(), EntityStatus::Synced);
            }
            other => panic!("expected Insert, got {other:?}"),
        }
    }

    #[test]
    fn test_deletion_of_unknown_record_skipped() {
        let rec = record(FieldMap::new(), true);
        assert!(matches!(
            detector().classify(&rec, None, ts(60)),
            RecordChange::Skip
        ));
    }

    #[test]
    fn test_remote_only_change_is_update() {
        let entity = base_entity();
        let rec = record(
            fields(&[("stage", json!("Proposal")), ("amount", json!(2000))]),
            false,
        );
        match detector().classify(&rec, Some(&entity), ts(60)) {
            RecordChange::Update {
                entity,
                applied_fields,
            } => {
                assert_eq!(entity.fields()["amount"], json!(2000));
                assert_eq!(applied_fields.len(), 1);
                assert!(applied_fields.contains("amount"));
            }
            other => panic!("expected Update, got {other:?}"),
        }
    }

    #[test]
    fn test_unchanged_remote_is_bookkeeping_only() {
        let mut entity = base_entity();
        entity.set_field("owner", json!("avery"), ts(10));

        let rec = record(
            fields(&[("stage", json!("Proposal")), ("amount", json!(1000))]),
            false,
        );
        match detector().classify(&rec, Some(&entity), ts(60)) {
            RecordChange::BookkeepingOnly(entity) => {
                // Local edit survives untouched
                assert_eq!(entity.fields()["owner"], json!("avery"));
                assert_eq!(entity.last_synced_remote_modified_at(), Some(ts(50)));
            }
            other => panic!("expected BookkeepingOnly, got {other:?}"),
        }
    }

    #[test]
    fn test_disjoint_edits_auto_merge() {
        // Local edited stage, remote changed amount: both survive
        let mut entity = base_entity();
        entity.set_field("stage", json!("Negotiation"), ts(10));

        let rec = record(
            fields(&[("stage", json!("Proposal")), ("amount", json!(9999))]),
            false,
        );
        match detector().classify(&rec, Some(&entity), ts(60)) {
            RecordChange::AutoMerge {
                entity,
                applied_fields,
            } => {
                assert_eq!(entity.fields()["amount"], json!(9999));
                assert_eq!(entity.fields()["stage"], json!("Negotiation"));
                assert!(applied_fields.contains("amount"));
                assert!(!applied_fields.contains("stage"));
            }
            other => panic!("expected AutoMerge, got {other:?}"),
        }
    }

    #[test]
    fn test_same_field_divergence_is_conflict() {
        // Both sides moved stage, to different values; remote also changed
        // amount, which must still be applied
        let mut entity = base_entity();
        entity.set_field("stage", json!("Negotiation"), ts(10));

        let rec = record(
            fields(&[("stage", json!("Closed Lost")), ("amount", json!(0))]),
            false,
        );
        match detector().classify(&rec, Some(&entity), ts(60)) {
            RecordChange::ConflictDetected {
                entity,
                conflict,
                applied_fields,
            } => {
                // Conflicting field untouched, non-conflicting applied
                assert_eq!(entity.fields()["stage"], json!("Negotiation"));
                assert_eq!(entity.fields()["amount"], json!(0));
                assert!(applied_fields.contains("amount"));
                assert_eq!(*entity.status(), EntityStatus::Conflicted);

                assert!(!conflict.is_resolved());
                assert_eq!(conflict.fields().len(), 1);
                assert_eq!(conflict.local_values()["stage"], json!("Negotiation"));
                assert_eq!(conflict.remote_values()["stage"], json!("Closed Lost"));
            }
            other => panic!("expected ConflictDetected, got {other:?}"),
        }
    }

    #[test]
    fn test_convergent_edit_is_not_a_conflict() {
        // Both sides set stage to the same value
        let mut entity = base_entity();
        entity.set_field("stage", json!("Won"), ts(10));

        let rec = record(
            fields(&[("stage", json!("Won")), ("amount", json!(1000))]),
            false,
        );
        match detector().classify(&rec, Some(&entity), ts(60)) {
            RecordChange::AutoMerge { entity, .. } | RecordChange::Update { entity, .. } => {
                assert_eq!(entity.fields()["stage"], json!("Won"));
            }
            other => panic!("expected clean apply, got {other:?}"),
        }
    }

    #[test]
    fn test_remote_deletion_tombstones() {
        let entity = base_entity();
        let rec = record(FieldMap::new(), true);
        match detector().classify(&rec, Some(&entity), ts(60)) {
            RecordChange::Tombstone(entity) => {
                assert_eq!(*entity.status(), EntityStatus::Tombstoned);
                assert_eq!(entity.tombstoned_at(), Some(ts(60)));
                // Field values retained for the audit window
                assert_eq!(entity.fields()["stage"], json!("Proposal"));
            }
            other => panic!("expected Tombstone, got {other:?}"),
        }
    }

    #[test]
    fn test_remote_wins_policy_auto_resolves() {
        let mut entity = base_entity();
        entity.set_field("stage", json!("Negotiation"), ts(10));

        let rec = record(fields(&[("stage", json!("Closed Won"))]), false);
        let det = ChangeDetector::new(ConflictPolicy::RemoteWins);
        match det.classify(&rec, Some(&entity), ts(60)) {
            RecordChange::ConflictDetected {
                entity, conflict, ..
            } => {
                assert_eq!(entity.fields()["stage"], json!("Closed Won"));
                assert_eq!(
                    conflict.resolution_status(),
                    ResolutionStatus::ResolvedRemote
                );
                assert_eq!(conflict.resolved_by(), Some("policy:remote_wins"));
                // The conflicted field was the only pending local edit, so
                // the entity is fully synced again
                assert!(entity.locally_changed_fields().is_empty());
                assert_eq!(*entity.status(), EntityStatus::Synced);
            }
            other => panic!("expected ConflictDetected, got {other:?}"),
        }
    }

    #[test]
    fn test_remote_wins_keeps_pending_status_for_other_local_edits() {
        let mut entity = base_entity();
        entity.set_field("stage", json!("Negotiation"), ts(10));
        entity.set_field("owner", json!("avery"), ts(11));

        let rec = record(fields(&[("stage", json!("Closed Won"))]), false);
        let det = ChangeDetector::new(ConflictPolicy::RemoteWins);
        match det.classify(&rec, Some(&entity), ts(60)) {
            RecordChange::ConflictDetected { entity, .. } => {
                assert_eq!(entity.fields()["stage"], json!("Closed Won"));
                // The unrelated owner edit is still waiting to be pushed
                assert_eq!(entity.locally_changed_fields().len(), 1);
                assert_eq!(*entity.status(), EntityStatus::PendingLocalChange);
            }
            other => panic!("expected ConflictDetected, got {other:?}"),
        }
    }

    #[test]
    fn test_local_wins_policy_keeps_local_values() {
        let mut entity = base_entity();
        entity.set_field("stage", json!("Negotiation"), ts(10));

        let rec = record(fields(&[("stage", json!("Closed Won"))]), false);
        let det = ChangeDetector::new(ConflictPolicy::LocalWins);
        match det.classify(&rec, Some(&entity), ts(60)) {
            RecordChange::ConflictDetected {
                entity, conflict, ..
            } => {
                assert_eq!(entity.fields()["stage"], json!("Negotiation"));
                assert_eq!(
                    conflict.resolution_status(),
                    ResolutionStatus::ResolvedLocal
                );
                // Unpushed local edit remains pending
                assert_eq!(*entity.status(), EntityStatus::PendingLocalChange);
            }
            other => panic!("expected ConflictDetected, got {other:?}"),
        }
    }
}

//! Conflict resolution executor
//!
//! Applies a [`ResolutionStrategy`] to a persisted conflict:
//! - `RemoteWins`: apply the remote values to the local entity
//! - `LocalWins`: push the local values back to the remote
//! - `Merged`: write the chosen values on both sides
//!
//! Every resolution is forward-only and leaves an immutable audit entry
//! with the before/after values.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use pipesync_core::domain::audit::{AuditAction, AuditEntry};
use pipesync_core::domain::conflict::{Conflict, ResolutionStrategy};
use pipesync_core::domain::entity::{EntityStatus, FieldMap, LocalEntity};
use pipesync_core::domain::newtypes::ConflictId;
use pipesync_core::ports::remote_crm::{IRemoteCrm, RecordUpdate};
use pipesync_core::ports::state_repository::{ConflictFilter, IStateRepository};

use crate::error::ConflictError;

/// Applies conflict resolutions, including the remote push-back
pub struct ConflictResolver {
    remote: Arc<dyn IRemoteCrm + Send + Sync>,
    repository: Arc<dyn IStateRepository + Send + Sync>,
}

impl ConflictResolver {
    pub fn new(
        remote: Arc<dyn IRemoteCrm + Send + Sync>,
        repository: Arc<dyn IStateRepository + Send + Sync>,
    ) -> Self {
        Self { remote, repository }
    }

    /// Resolves one conflict with the given strategy
    ///
    /// Returns the resolved conflict. Fails without changing state if the
    /// conflict is unknown, already resolved, or the remote rejects the
    /// push-back.
    pub async fn apply_resolution(
        &self,
        conflict_id: &ConflictId,
        strategy: ResolutionStrategy,
        resolved_by: &str,
    ) -> Result<Conflict, ConflictError> {
        let mut conflict = self
            .repository
            .get_conflict(conflict_id)
            .await
            .map_err(|e| ConflictError::ResolutionFailed(format!("load conflict: {e}")))?
            .ok_or_else(|| ConflictError::NotFound(conflict_id.to_string()))?;

        if conflict.is_resolved() {
            return Err(ConflictError::AlreadyResolved(conflict_id.to_string()));
        }

        let mut entity = self
            .repository
            .get_entity(conflict.remote_id())
            .await
            .map_err(|e| ConflictError::ResolutionFailed(format!("load entity: {e}")))?
            .ok_or_else(|| ConflictError::EntityNotFound(conflict.remote_id().to_string()))?;

        info!(
            conflict_id = %conflict_id,
            remote_id = %conflict.remote_id(),
            strategy = %strategy,
            resolved_by,
            "applying conflict resolution"
        );

        let previous: FieldMap = conflict
            .fields()
            .iter()
            .filter_map(|name| entity.fields().get(name).map(|v| (name.clone(), v.clone())))
            .collect();
        let chosen = conflict.chosen_values(&strategy);
        let now = Utc::now();

        match &strategy {
            ResolutionStrategy::RemoteWins => {
                entity.apply_remote_fields(&chosen, conflict.remote_modified_at(), now);
            }
            ResolutionStrategy::LocalWins | ResolutionStrategy::Merged(_) => {
                self.push_back(&entity, &chosen).await?;
                // The pushed values are now the synced baseline on both sides
                entity.apply_remote_fields(&chosen, now, now);
            }
        }

        conflict
            .resolve(&strategy, resolved_by)
            .map_err(|e| ConflictError::ResolutionFailed(e.to_string()))?;
        self.repository
            .save_conflict(&conflict)
            .await
            .map_err(|e| ConflictError::ResolutionFailed(format!("save conflict: {e}")))?;

        // Clear the conflicted status once no unresolved conflicts remain
        let remaining = self
            .repository
            .list_conflicts(&ConflictFilter {
                remote_id: Some(conflict.remote_id().clone()),
                ..ConflictFilter::unresolved()
            })
            .await
            .map_err(|e| ConflictError::ResolutionFailed(format!("list conflicts: {e}")))?;
        if remaining.is_empty() && matches!(entity.status(), EntityStatus::Conflicted) {
            let status = if entity.locally_changed_fields().is_empty() {
                EntityStatus::Synced
            } else {
                EntityStatus::PendingLocalChange
            };
            entity.set_status(status);
        }

        self.repository
            .save_entity(&entity)
            .await
            .map_err(|e| ConflictError::ResolutionFailed(format!("save entity: {e}")))?;

        let audit = AuditEntry::new(AuditAction::ConflictResolved, resolved_by)
            .with_record(conflict.remote_id().clone())
            .with_values(previous, chosen)
            .with_details(json!({
                "conflict_id": conflict_id.to_string(),
                "strategy": strategy.to_string(),
            }));
        self.repository
            .save_audit(&audit)
            .await
            .map_err(|e| ConflictError::ResolutionFailed(format!("save audit: {e}")))?;

        Ok(conflict)
    }

    /// Pushes resolved values back to the remote, failing the resolution
    /// if the remote rejects the record
    async fn push_back(&self, entity: &LocalEntity, values: &FieldMap) -> Result<(), ConflictError> {
        let update = RecordUpdate {
            remote_id: entity.remote_id().clone(),
            fields: values.clone(),
        };
        let outcomes = self
            .remote
            .update_records(std::slice::from_ref(&update))
            .await
            .map_err(|e| ConflictError::ResolutionFailed(format!("push back: {e}")))?;

        if let Some(outcome) = outcomes.iter().find(|o| !o.is_success()) {
            warn!(
                remote_id = %outcome.remote_id,
                error = ?outcome.error,
                "remote rejected conflict push-back"
            );
            return Err(ConflictError::ResolutionFailed(format!(
                "remote rejected {}: {}",
                outcome.remote_id,
                outcome.error.clone().unwrap_or_default()
            )));
        }
        Ok(())
    }
}

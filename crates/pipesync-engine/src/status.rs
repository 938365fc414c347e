//! Read-only status projection
//!
//! Assembles the snapshot the control interface serves from `/status`:
//! the active session (if any), the most recently completed one, and
//! store-level counts.

use chrono::{DateTime, Utc};
use serde::Serialize;

use pipesync_core::domain::newtypes::SessionId;
use pipesync_core::domain::session::{SessionKind, SessionStatus, SyncSession};
use pipesync_core::ports::state_repository::{ConflictFilter, IStateRepository};

/// Condensed view of one session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub kind: SessionKind,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub records_processed: u64,
    pub records_total: Option<u64>,
    pub api_calls_made: u64,
    pub record_errors: u64,
    pub last_error: Option<String>,
}

impl From<&SyncSession> for SessionSummary {
    fn from(session: &SyncSession) -> Self {
        Self {
            id: *session.id(),
            kind: session.kind(),
            status: session.status().clone(),
            created_at: session.created_at(),
            completed_at: session.completed_at(),
            records_processed: session.records_processed(),
            records_total: session.records_total(),
            api_calls_made: session.api_calls_made(),
            record_errors: session.record_errors(),
            last_error: session.last_error().map(str::to_string),
        }
    }
}

/// Snapshot of overall sync health
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub active_session: Option<SessionSummary>,
    pub last_completed_session: Option<SessionSummary>,
    pub active_entities: u64,
    pub unresolved_conflicts: u64,
}

/// Builds the status snapshot from the store
pub async fn status_report(
    repository: &(dyn IStateRepository + Send + Sync),
) -> anyhow::Result<StatusReport> {
    let active = repository.find_active_session().await?;
    let last_completed = repository.latest_completed_session().await?;
    let active_entities = repository.count_active_entities().await?;
    let unresolved_conflicts = repository
        .list_conflicts(&ConflictFilter::unresolved())
        .await?
        .len() as u64;

    Ok(StatusReport {
        active_session: active.as_ref().map(SessionSummary::from),
        last_completed_session: last_completed.as_ref().map(SessionSummary::from),
        active_entities,
        unresolved_conflicts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipesync_store::{DatabasePool, SqliteStateRepository};

    #[tokio::test]
    async fn test_empty_store_reports_nothing() {
        let db = DatabasePool::in_memory().await.unwrap();
        let repository = SqliteStateRepository::new(db.pool().clone());

        let report = status_report(&repository).await.unwrap();
        assert!(report.active_session.is_none());
        assert!(report.last_completed_session.is_none());
        assert_eq!(report.active_entities, 0);
        assert_eq!(report.unresolved_conflicts, 0);
    }

    #[tokio::test]
    async fn test_reports_last_completed_session() {
        let db = DatabasePool::in_memory().await.unwrap();
        let repository = SqliteStateRepository::new(db.pool().clone());

        let mut session =
            SyncSession::new(SessionKind::Full, 1);
        session.start().unwrap();
        session.set_records_total(10);
        session.add_records_processed(10);
        session.complete().unwrap();
        repository.save_session(&session).await.unwrap();

        let report = status_report(&repository).await.unwrap();
        let last = report.last_completed_session.unwrap();
        assert_eq!(last.id, *session.id());
        assert_eq!(last.records_processed, 10);
        assert!(report.active_session.is_none());
    }
}

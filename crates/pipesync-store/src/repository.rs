//! SQLite implementation of the state repository port
//!
//! Domain entities are persisted as serde JSON in a `data` column; the
//! columns queries filter or sort on (status, timestamps, record ids) are
//! extracted alongside. Reconstruction always goes through serde, so the
//! domain types keep their private fields and invariants.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{Row, SqliteConnection, SqlitePool};

use pipesync_core::domain::audit::AuditEntry;
use pipesync_core::domain::checkpoint::Checkpoint;
use pipesync_core::domain::conflict::Conflict;
use pipesync_core::domain::cursor::Cursor;
use pipesync_core::domain::entity::LocalEntity;
use pipesync_core::domain::newtypes::{ConflictId, RemoteRecordId, SessionId};
use pipesync_core::domain::session::{SessionStatus, SyncSession};
use pipesync_core::ports::state_repository::{
    ChunkWrite, ConflictFilter, IStateRepository, RateBudgetSnapshot,
};

use crate::{writer, StoreError};

/// SQLite-based implementation of the state repository port
pub struct SqliteStateRepository {
    pool: SqlitePool,
}

impl SqliteStateRepository {
    /// Creates a new repository instance with the given connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

// ============================================================================
// Helper functions for type conversion
// ============================================================================

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

pub(crate) fn from_json<T: DeserializeOwned>(raw: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Status discriminant for the indexed column; the failure reason lives in
/// the JSON blob
pub(crate) fn session_status_discriminant(status: &SessionStatus) -> &'static str {
    match status {
        SessionStatus::Pending => "pending",
        SessionStatus::Running => "running",
        SessionStatus::Completed => "completed",
        SessionStatus::Failed(_) => "failed",
        SessionStatus::Cancelled => "cancelled",
    }
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("failed to parse datetime '{}': {}", s, e)))
}

// ============================================================================
// Row writers, shared with the chunk writer
// ============================================================================

pub(crate) async fn upsert_session(
    conn: &mut SqliteConnection,
    session: &SyncSession,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO sessions (id, kind, status, created_at, completed_at, data)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
             kind = excluded.kind,
             status = excluded.status,
             created_at = excluded.created_at,
             completed_at = excluded.completed_at,
             data = excluded.data",
    )
    .bind(session.id().to_string())
    .bind(session.kind().to_string())
    .bind(session_status_discriminant(session.status()))
    .bind(session.created_at().to_rfc3339())
    .bind(session.completed_at().map(|t| t.to_rfc3339()))
    .bind(to_json(session)?)
    .execute(conn)
    .await?;
    Ok(())
}

pub(crate) async fn upsert_entity(
    conn: &mut SqliteConnection,
    entity: &LocalEntity,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO entities (remote_id, status, remote_modified_at, data)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(remote_id) DO UPDATE SET
             status = excluded.status,
             remote_modified_at = excluded.remote_modified_at,
             data = excluded.data",
    )
    .bind(entity.remote_id().as_str())
    .bind(entity.status().to_string())
    .bind(
        entity
            .last_synced_remote_modified_at()
            .map(|t| t.to_rfc3339()),
    )
    .bind(to_json(entity)?)
    .execute(conn)
    .await?;
    Ok(())
}

pub(crate) async fn upsert_conflict(
    conn: &mut SqliteConnection,
    conflict: &Conflict,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO conflicts (id, remote_id, resolution_status, detected_at, data)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
             resolution_status = excluded.resolution_status,
             data = excluded.data",
    )
    .bind(conflict.id().to_string())
    .bind(conflict.remote_id().as_str())
    .bind(conflict.resolution_status().to_string())
    .bind(conflict.detected_at().to_rfc3339())
    .bind(to_json(conflict)?)
    .execute(conn)
    .await?;
    Ok(())
}

/// Audit entries are immutable; REPLACE only matters for idempotent replay
/// of a chunk after a crash, where the same entry ids come around again.
pub(crate) async fn insert_audit(
    conn: &mut SqliteConnection,
    entry: &AuditEntry,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT OR REPLACE INTO audit_log (id, timestamp, session_id, remote_id, action, data)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(entry.id().to_string())
    .bind(entry.timestamp().to_rfc3339())
    .bind(entry.session_id().map(|s| s.to_string()))
    .bind(entry.remote_id().map(|r| r.as_str().to_string()))
    .bind(entry.action().to_string())
    .bind(to_json(entry)?)
    .execute(conn)
    .await?;
    Ok(())
}

pub(crate) async fn upsert_checkpoint(
    conn: &mut SqliteConnection,
    checkpoint: &Checkpoint,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO checkpoints (session_id, cursor, records_processed, committed_at)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(session_id) DO UPDATE SET
             cursor = excluded.cursor,
             records_processed = excluded.records_processed,
             committed_at = excluded.committed_at",
    )
    .bind(checkpoint.session_id.to_string())
    .bind(checkpoint.cursor.as_str())
    .bind(checkpoint.records_processed as i64)
    .bind(checkpoint.committed_at.to_rfc3339())
    .execute(conn)
    .await?;
    Ok(())
}

// ============================================================================
// IStateRepository implementation
// ============================================================================

#[async_trait]
impl IStateRepository for SqliteStateRepository {
    async fn save_session(&self, session: &SyncSession) -> anyhow::Result<()> {
        let mut conn = self.pool.acquire().await?;
        upsert_session(&mut conn, session).await?;
        Ok(())
    }

    async fn get_session(&self, id: &SessionId) -> anyhow::Result<Option<SyncSession>> {
        let row = sqlx::query("SELECT data FROM sessions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| from_json(r.get::<String, _>("data").as_str()))
            .transpose()
            .map_err(Into::into)
    }

    async fn find_active_session(&self) -> anyhow::Result<Option<SyncSession>> {
        let row = sqlx::query(
            "SELECT data FROM sessions WHERE status IN ('pending', 'running')
             ORDER BY created_at DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| from_json(r.get::<String, _>("data").as_str()))
            .transpose()
            .map_err(Into::into)
    }

    async fn latest_completed_session(&self) -> anyhow::Result<Option<SyncSession>> {
        let row = sqlx::query(
            "SELECT data FROM sessions WHERE status = 'completed'
             ORDER BY completed_at DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| from_json(r.get::<String, _>("data").as_str()))
            .transpose()
            .map_err(Into::into)
    }

    async fn get_entity(&self, remote_id: &RemoteRecordId) -> anyhow::Result<Option<LocalEntity>> {
        let row = sqlx::query("SELECT data FROM entities WHERE remote_id = ?")
            .bind(remote_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| from_json(r.get::<String, _>("data").as_str()))
            .transpose()
            .map_err(Into::into)
    }

    async fn save_entity(&self, entity: &LocalEntity) -> anyhow::Result<()> {
        let mut conn = self.pool.acquire().await?;
        upsert_entity(&mut conn, entity).await?;
        Ok(())
    }

    async fn count_active_entities(&self) -> anyhow::Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM entities WHERE status != 'tombstoned'")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n") as u64)
    }

    async fn max_remote_modified_at(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
        // RFC 3339 timestamps in UTC sort lexicographically
        let row = sqlx::query("SELECT MAX(remote_modified_at) AS m FROM entities")
            .fetch_one(&self.pool)
            .await?;
        let max: Option<String> = row.get("m");
        max.as_deref().map(parse_datetime).transpose().map_err(Into::into)
    }

    async fn save_conflict(&self, conflict: &Conflict) -> anyhow::Result<()> {
        let mut conn = self.pool.acquire().await?;
        upsert_conflict(&mut conn, conflict).await?;
        Ok(())
    }

    async fn get_conflict(&self, id: &ConflictId) -> anyhow::Result<Option<Conflict>> {
        let row = sqlx::query("SELECT data FROM conflicts WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| from_json(r.get::<String, _>("data").as_str()))
            .transpose()
            .map_err(Into::into)
    }

    async fn list_conflicts(&self, filter: &ConflictFilter) -> anyhow::Result<Vec<Conflict>> {
        let mut sql = String::from("SELECT data FROM conflicts WHERE 1 = 1");
        if filter.resolution_status.is_some() {
            sql.push_str(" AND resolution_status = ?");
        }
        if filter.remote_id.is_some() {
            sql.push_str(" AND remote_id = ?");
        }
        sql.push_str(" ORDER BY detected_at DESC");
        if filter.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut query = sqlx::query(&sql);
        if let Some(status) = filter.resolution_status {
            query = query.bind(status.to_string());
        }
        if let Some(remote_id) = &filter.remote_id {
            query = query.bind(remote_id.as_str());
        }
        if let Some(limit) = filter.limit {
            query = query.bind(limit as i64);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|r| from_json(r.get::<String, _>("data").as_str()).map_err(Into::into))
            .collect()
    }

    async fn save_audit(&self, entry: &AuditEntry) -> anyhow::Result<()> {
        let mut conn = self.pool.acquire().await?;
        insert_audit(&mut conn, entry).await?;
        Ok(())
    }

    async fn get_checkpoint(&self, session_id: &SessionId) -> anyhow::Result<Option<Checkpoint>> {
        let row = sqlx::query(
            "SELECT cursor, records_processed, committed_at
             FROM checkpoints WHERE session_id = ?",
        )
        .bind(session_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| -> Result<Checkpoint, StoreError> {
            Ok(Checkpoint {
                session_id: *session_id,
                cursor: Cursor::from_raw(r.get::<String, _>("cursor")),
                records_processed: r.get::<i64, _>("records_processed") as u64,
                committed_at: parse_datetime(&r.get::<String, _>("committed_at"))?,
            })
        })
        .transpose()
        .map_err(Into::into)
    }

    async fn apply_chunk(&self, chunk: &ChunkWrite) -> anyhow::Result<()> {
        writer::apply_chunk(&self.pool, chunk).await?;
        Ok(())
    }

    async fn save_rate_budget(&self, snapshot: &RateBudgetSnapshot) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO rate_budget (id, window_started_at, calls_used)
             VALUES (1, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 window_started_at = excluded.window_started_at,
                 calls_used = excluded.calls_used",
        )
        .bind(snapshot.window_started_at.to_rfc3339())
        .bind(snapshot.calls_used as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_rate_budget(&self) -> anyhow::Result<Option<RateBudgetSnapshot>> {
        let row = sqlx::query("SELECT window_started_at, calls_used FROM rate_budget WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| -> Result<RateBudgetSnapshot, StoreError> {
            Ok(RateBudgetSnapshot {
                window_started_at: parse_datetime(&r.get::<String, _>("window_started_at"))?,
                calls_used: r.get::<i64, _>("calls_used") as u32,
            })
        })
        .transpose()
        .map_err(Into::into)
    }
}

//! Transactional chunk commit
//!
//! One committed chunk is the engine's unit of durability: the entity
//! upserts, detected conflicts, audit entries, session counters, and the
//! advanced checkpoint all land in a single SQLite transaction. A crash at
//! any point leaves the store at the previous checkpoint, and replaying the
//! same chunk is idempotent (entity writes are keyed upserts, audit entries
//! carry stable ids).

use sqlx::SqlitePool;
use tracing::debug;

use pipesync_core::ports::state_repository::ChunkWrite;

use crate::repository::{
    insert_audit, upsert_checkpoint, upsert_conflict, upsert_entity, upsert_session,
};
use crate::StoreError;

/// Applies one chunk atomically
pub async fn apply_chunk(pool: &SqlitePool, chunk: &ChunkWrite) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;

    for entity in &chunk.entities {
        upsert_entity(&mut *tx, entity).await?;
    }
    for conflict in &chunk.conflicts {
        upsert_conflict(&mut *tx, conflict).await?;
    }
    for entry in &chunk.audits {
        insert_audit(&mut *tx, entry).await?;
    }
    upsert_session(&mut *tx, &chunk.session).await?;
    upsert_checkpoint(&mut *tx, &chunk.checkpoint).await?;

    tx.commit().await?;

    debug!(
        session_id = %chunk.session.id(),
        entities = chunk.entities.len(),
        conflicts = chunk.conflicts.len(),
        records_processed = chunk.checkpoint.records_processed,
        "chunk committed"
    );
    Ok(())
}

//! Durable sync progress checkpoints
//!
//! A [`Checkpoint`] is the sole source of truth for resuming an interrupted
//! session. It is written in the same transaction as the chunk it describes,
//! so "chunk committed" and "checkpoint advanced" are atomic with respect to
//! a crash.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::cursor::Cursor;
use super::newtypes::SessionId;

/// Durable record of a session's forward progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Session this checkpoint belongs to
    pub session_id: SessionId,
    /// Cursor to resume from (the *next* page to fetch)
    pub cursor: Cursor,
    /// Records committed up to and including this checkpoint
    pub records_processed: u64,
    /// When the checkpoint was written
    pub committed_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Creates a checkpoint for the given resume position
    pub fn new(session_id: SessionId, cursor: Cursor, records_processed: u64) -> Self {
        Self {
            session_id,
            cursor,
            records_processed,
            committed_at: Utc::now(),
        }
    }
}

//! Progress events for running sessions
//!
//! Events are broadcast best-effort: a slow or absent observer never blocks
//! the chunk loop, and a lagging receiver simply misses events.

use serde::Serialize;

use pipesync_core::domain::newtypes::SessionId;
use pipesync_core::domain::session::{SessionKind, SessionStatus, SyncPhase, SyncSession};

/// Snapshot of a session's progress at a phase boundary
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub session_id: SessionId,
    pub kind: SessionKind,
    pub status: SessionStatus,
    pub phase: SyncPhase,
    pub records_processed: u64,
    pub records_total: Option<u64>,
    pub api_calls_made: u64,
    pub record_errors: u64,
}

impl ProgressEvent {
    /// Builds an event from the session's current counters
    pub fn snapshot(session: &SyncSession, phase: SyncPhase) -> Self {
        Self {
            session_id: *session.id(),
            kind: session.kind(),
            status: session.status().clone(),
            phase,
            records_processed: session.records_processed(),
            records_total: session.records_total(),
            api_calls_made: session.api_calls_made(),
            record_errors: session.record_errors(),
        }
    }
}

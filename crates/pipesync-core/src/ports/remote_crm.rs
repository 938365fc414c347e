//! Remote CRM port
//!
//! Abstracts the CRM's paginated record API. The production adapter talks
//! HTTP and enforces the call-rate budget; tests implement this trait with
//! scripted fakes.

use async_trait::async_trait;

use crate::domain::cursor::Cursor;
use crate::domain::entity::{ChangeRecord, FieldMap};
use crate::domain::newtypes::{RemoteRecordId, SessionId};
use crate::domain::session::SessionKind;

/// One page of remote changes
#[derive(Debug, Clone)]
pub struct ChangePage {
    /// Records in this page, field-mapped and ordered as the remote
    /// returned them
    pub records: Vec<ChangeRecord>,
    /// Cursor addressing the page *after* this one
    pub next_cursor: Cursor,
    /// Whether more pages follow
    pub has_more: bool,
    /// Total records the remote expects to return for this traversal,
    /// when it reports one (full syncs usually do, incremental may not)
    pub records_total: Option<u64>,
    /// Records in this page the adapter dropped as malformed
    pub malformed: u64,
}

/// A local change to push back to the remote
#[derive(Debug, Clone, PartialEq)]
pub struct RecordUpdate {
    /// Record to update
    pub remote_id: RemoteRecordId,
    /// Field values to write (local field names; the adapter un-maps them)
    pub fields: FieldMap,
}

/// Per-record result of a push-back batch
///
/// The remote applies batches non-atomically, so each record reports its
/// own outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOutcome {
    /// Record this outcome describes
    pub remote_id: RemoteRecordId,
    /// Remote-side error message, `None` on success
    pub error: Option<String>,
}

impl UpdateOutcome {
    /// Returns true if the remote accepted the update
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Port for the remote CRM's record API
///
/// Implementations own transport, authentication, and the call-rate budget;
/// every method that reaches the network must first acquire budget.
#[async_trait]
pub trait IRemoteCrm {
    /// Fetches one page of records for a traversal
    ///
    /// `cursor` addresses the page to fetch; the returned page carries the
    /// cursor for the next one. `session_id` is stamped onto the records
    /// for bookkeeping.
    async fn fetch_page(
        &self,
        session_id: SessionId,
        kind: SessionKind,
        cursor: &Cursor,
    ) -> anyhow::Result<ChangePage>;

    /// Checks whether a cursor is still honored by the remote
    ///
    /// Remotes expire incremental cursors after retention windows; a stale
    /// cursor means the caller must fall back to a full traversal.
    async fn validate_cursor(&self, cursor: &Cursor) -> anyhow::Result<bool>;

    /// Pushes local changes back to the remote
    ///
    /// `updates` must not exceed the remote's batch ceiling (100 records);
    /// callers split larger sets. Returns one outcome per update, in order.
    async fn update_records(&self, updates: &[RecordUpdate]) -> anyhow::Result<Vec<UpdateOutcome>>;
}

//! Resume cursors for paginated fetches
//!
//! A [`Cursor`] is the opaque token persisted in checkpoints and carried by
//! sessions. Internally it encodes a [`CursorState`]: an absolute offset for
//! full exports, or a "modified since" watermark plus a tie-break record ID
//! for incremental fetches. The tie-break key guarantees that records sharing
//! a modification timestamp at a page boundary are neither skipped nor
//! duplicated when the fetch resumes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::newtypes::RemoteRecordId;

/// Typed interior of a [`Cursor`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CursorState {
    /// Position within a full export of the remote collection
    Full {
        /// Number of records already consumed
        offset: u64,
    },
    /// Position within an incremental (modified-since) fetch
    Incremental {
        /// Lower bound on `remote_modified_at` (inclusive)
        watermark: DateTime<Utc>,
        /// Last record consumed at exactly the watermark timestamp, if any.
        /// The remote orders ties by record ID, so resuming after this ID
        /// skips already-seen records without losing same-timestamp peers.
        after_id: Option<RemoteRecordId>,
    },
}

impl CursorState {
    /// Starting state for a full export
    pub fn full_start() -> Self {
        CursorState::Full { offset: 0 }
    }

    /// Starting state for an incremental fetch from the given watermark
    pub fn incremental_start(watermark: DateTime<Utc>) -> Self {
        CursorState::Incremental {
            watermark,
            after_id: None,
        }
    }

    /// Encodes this state as an opaque cursor token
    pub fn encode(&self) -> Cursor {
        // serde_json cannot fail on this shape
        Cursor(serde_json::to_string(self).unwrap_or_default())
    }
}

/// Opaque resume position for a sync session
///
/// Consumers treat the token as a black box; only the engine and the
/// fetcher decode it. Stored verbatim in checkpoints and session rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    /// Wraps a raw token previously produced by [`CursorState::encode`]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Returns the raw token string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decodes the typed interior of this cursor
    ///
    /// # Errors
    /// Returns [`DomainError::InvalidCursor`] if the token is not a cursor
    /// this engine produced (e.g. truncated by checkpoint corruption).
    pub fn decode(&self) -> Result<CursorState, DomainError> {
        serde_json::from_str(&self.0).map_err(|e| DomainError::InvalidCursor(e.to_string()))
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

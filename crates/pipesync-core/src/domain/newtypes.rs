//! Domain newtypes with validation
//!
//! Strongly-typed wrappers for identifiers. UUID-backed IDs are generated
//! locally; [`RemoteRecordId`] wraps the CRM's own identifier and is
//! validated as non-empty at construction time.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::DomainError;

// ============================================================================
// UUID-based ID types
// ============================================================================

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new random identifier
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Create an identifier from an existing UUID
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID value
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| DomainError::InvalidId(format!("Invalid UUID: {e}")))
            }
        }
    };
}

uuid_id!(
    /// Identifier for a [`SyncSession`](super::session::SyncSession)
    SessionId
);
uuid_id!(
    /// Identifier for a [`Conflict`](super::conflict::Conflict)
    ConflictId
);
uuid_id!(
    /// Identifier for an [`AuditEntry`](super::audit::AuditEntry)
    AuditId
);

// ============================================================================
// RemoteRecordId
// ============================================================================

/// The CRM's identifier for a record
///
/// Opaque to the engine but used as the idempotency key for all local
/// writes, so it must be non-empty and free of leading/trailing whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteRecordId(String);

impl RemoteRecordId {
    /// Creates a validated remote record ID
    pub fn new(id: impl Into<String>) -> Result<Self, DomainError> {
        let id = id.into();
        if id.trim().is_empty() || id != id.trim() {
            return Err(DomainError::InvalidRemoteId(id));
        }
        Ok(Self(id))
    }

    /// Returns the raw identifier string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RemoteRecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

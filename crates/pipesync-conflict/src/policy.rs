//! Default conflict policy
//!
//! The configured policy decides what happens the moment a divergence is
//! detected. `ManualOnly` is the default: conflicts are recorded and left
//! for an operator. The two automatic policies resolve at detection time
//! and are attributed to the policy in the audit trail.

use std::str::FromStr;

use pipesync_core::domain::conflict::ResolutionStrategy;

use crate::error::ConflictError;

/// Policy applied when the detector finds a divergence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Remote values win; the conflict is recorded as auto-resolved
    RemoteWins,
    /// Local values win and are pushed back to the remote
    LocalWins,
    /// Record the conflict and wait for an operator
    #[default]
    ManualOnly,
}

impl ConflictPolicy {
    /// Strategy this policy auto-applies, or `None` for manual handling
    pub fn auto_strategy(&self) -> Option<ResolutionStrategy> {
        match self {
            ConflictPolicy::RemoteWins => Some(ResolutionStrategy::RemoteWins),
            ConflictPolicy::LocalWins => Some(ResolutionStrategy::LocalWins),
            ConflictPolicy::ManualOnly => None,
        }
    }

    /// Actor name recorded in audit entries for policy resolutions
    pub fn actor(&self) -> &'static str {
        match self {
            ConflictPolicy::RemoteWins => "policy:remote_wins",
            ConflictPolicy::LocalWins => "policy:local_wins",
            ConflictPolicy::ManualOnly => "policy:manual_only",
        }
    }
}

impl FromStr for ConflictPolicy {
    type Err = ConflictError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "remote_wins" => Ok(ConflictPolicy::RemoteWins),
            "local_wins" => Ok(ConflictPolicy::LocalWins),
            "manual_only" | "manual" => Ok(ConflictPolicy::ManualOnly),
            other => Err(ConflictError::UnknownPolicy(other.to_string())),
        }
    }
}

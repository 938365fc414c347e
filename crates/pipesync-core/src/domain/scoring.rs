//! Revenue-phase health scoring
//!
//! A pure function over [`LocalEntity`] snapshots, invoked by consumers
//! after a sync commit. It lives in the domain layer but is structurally
//! separate from the engine: nothing in the sync path calls it, so it can
//! evolve independently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::entity::{EntityStatus, LocalEntity};

/// Coarse revenue phase derived from the synchronized `stage` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevenuePhase {
    /// Early pipeline: prospecting, qualification
    Early,
    /// Active deal: proposal, negotiation
    Active,
    /// Closed won
    Won,
    /// Closed lost
    Lost,
    /// Stage missing or unrecognized
    Unknown,
}

/// Health assessment of one synchronized record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthScore {
    /// Derived revenue phase
    pub phase: RevenuePhase,
    /// 0 (dead) to 100 (healthy)
    pub score: u8,
    /// Human-readable factors that moved the score
    pub factors: Vec<String>,
}

/// Days without modification after which an active deal is considered stale
const STALE_AFTER_DAYS: i64 = 30;

fn phase_of(stage: Option<&Value>) -> RevenuePhase {
    let Some(stage) = stage.and_then(Value::as_str) else {
        return RevenuePhase::Unknown;
    };
    match stage.to_ascii_lowercase().as_str() {
        "prospecting" | "qualification" => RevenuePhase::Early,
        "proposal" | "negotiation" => RevenuePhase::Active,
        "closed won" | "won" => RevenuePhase::Won,
        "closed lost" | "lost" => RevenuePhase::Lost,
        _ => RevenuePhase::Unknown,
    }
}

/// Scores a single entity snapshot
///
/// Deterministic in its inputs: the entity and the evaluation time. Callers
/// pass `Utc::now()` outside tests.
pub fn health_score(entity: &LocalEntity, now: DateTime<Utc>) -> HealthScore {
    let phase = phase_of(entity.fields().get("stage"));
    let mut factors = Vec::new();

    if matches!(entity.status(), EntityStatus::Tombstoned) {
        return HealthScore {
            phase,
            score: 0,
            factors: vec!["record deleted remotely".to_string()],
        };
    }

    let mut score: i32 = match phase {
        RevenuePhase::Won => 100,
        RevenuePhase::Active => 70,
        RevenuePhase::Early => 50,
        RevenuePhase::Lost => 10,
        RevenuePhase::Unknown => 30,
    };

    let idle_days = (now - entity.local_modified_at()).num_days();
    if matches!(phase, RevenuePhase::Early | RevenuePhase::Active) && idle_days > STALE_AFTER_DAYS {
        score -= 25;
        factors.push(format!("no activity for {idle_days} days"));
    }

    if matches!(entity.status(), EntityStatus::Conflicted) {
        score -= 15;
        factors.push("unresolved sync conflict".to_string());
    }

    if entity
        .fields()
        .get("amount")
        .and_then(Value::as_f64)
        .is_none()
        && !matches!(phase, RevenuePhase::Lost)
    {
        score -= 10;
        factors.push("missing amount".to_string());
    }

    HealthScore {
        phase,
        score: score.clamp(0, 100) as u8,
        factors,
    }
}

//! Per-iteration audit trail.
//!
//! One JSON line per completed iteration in `.tandem/audit/iterations.jsonl`.
//! Tool calls are summarised as counts, never stored verbatim.

pub mod logger;

pub use logger::AuditLogger;

use crate::agents::{TurnEnd, TurnOutcome};
use crate::phase::Phase;
use crate::tracker::Rollback;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Counts from one implementer turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnAudit {
    pub tool_calls: usize,
    pub failed: usize,
    pub violations: usize,
    pub truncations: usize,
    /// Calls per tool name.
    #[serde(default)]
    pub tools: BTreeMap<String, usize>,
    pub ended: String,
}

impl From<&TurnOutcome> for TurnAudit {
    fn from(outcome: &TurnOutcome) -> Self {
        let mut tools = BTreeMap::new();
        for record in &outcome.records {
            *tools.entry(record.tool.clone()).or_insert(0) += 1;
        }
        Self {
            tool_calls: outcome.records.len(),
            failed: outcome.failures(),
            violations: outcome.violations(),
            truncations: outcome.truncations(),
            tools,
            ended: match outcome.end {
                TurnEnd::Finished => "finished",
                TurnEnd::BudgetExhausted => "budget_exhausted",
                TurnEnd::Cancelled => "cancelled",
            }
            .to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackAudit {
    pub to_iteration: u32,
    pub commit: String,
    pub floor: u8,
}

impl From<&Rollback> for RollbackAudit {
    fn from(rollback: &Rollback) -> Self {
        Self {
            to_iteration: rollback.to_iteration,
            commit: rollback.commit.clone(),
            floor: rollback.floor,
        }
    }
}

/// One completed iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationAudit {
    /// One controller process (start or resume).
    pub run_id: Uuid,
    pub session_id: Uuid,
    pub iteration: u32,
    pub phase_before: Phase,
    pub phase_after: Phase,
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
    /// Absent when the turn ran in an earlier, interrupted run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn: Option<TurnAudit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<String>,
    pub score: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aligned: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackAudit>,
}

//! Audit event log.
//!
//! RULE: every state transition the gate makes (decision issued, outcome
//! recorded, stratum verified or demoted, integrity violation, ...) is
//! appended to gate_event as a typed, serialized GateEvent.
//! Events are never updated; the maintenance runner prunes old rows.

use crate::types::{ArmId, DecisionId, EpochMillis, StratumKey};
use serde::{Deserialize, Serialize};

/// Variants are added over time, never removed or reordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GateEvent {
    // ── Decision path ──────────────────────────────
    DecisionIssued {
        decision_id: DecisionId,
        stratum: StratumKey,
        arm_id: ArmId,
        action: String,
    },
    SafetyCheckTimedOut {
        stratum: StratumKey,
    },

    // ── Outcome path ───────────────────────────────
    OutcomeRecorded {
        decision_id: DecisionId,
        stratum: StratumKey,
        first_validation: bool,
        is_false_negative: bool,
    },
    DownstreamReplayed {
        decision_id: DecisionId,
    },

    // ── Safety state machine ───────────────────────
    StratumVerified {
        stratum: StratumKey,
        upper_bound: f64,
        total_automated: i64,
    },
    StratumDemoted {
        stratum: StratumKey,
        upper_bound: f64,
        false_negatives: i64,
    },
    IntegrityViolation {
        stratum: StratumKey,
        detail: String,
    },
    StratumReset {
        stratum: StratumKey,
    },
    StratumReconciled {
        stratum: StratumKey,
    },

    // ── Context model / governance ─────────────────
    ContextSnapshotTaken {
        agent: String,
        version: i64,
    },
    ReportAppended {
        agent: String,
        report_id: i64,
        period_label: String,
    },
    EventsPruned {
        removed: usize,
    },
}

impl GateEvent {
    /// Stable string name used for the event_type column.
    pub fn type_name(&self) -> &'static str {
        match self {
            GateEvent::DecisionIssued { .. }       => "decision_issued",
            GateEvent::SafetyCheckTimedOut { .. }  => "safety_check_timed_out",
            GateEvent::OutcomeRecorded { .. }      => "outcome_recorded",
            GateEvent::DownstreamReplayed { .. }   => "downstream_replayed",
            GateEvent::StratumVerified { .. }      => "stratum_verified",
            GateEvent::StratumDemoted { .. }       => "stratum_demoted",
            GateEvent::IntegrityViolation { .. }   => "integrity_violation",
            GateEvent::StratumReset { .. }         => "stratum_reset",
            GateEvent::StratumReconciled { .. }    => "stratum_reconciled",
            GateEvent::ContextSnapshotTaken { .. } => "context_snapshot_taken",
            GateEvent::ReportAppended { .. }       => "report_appended",
            GateEvent::EventsPruned { .. }         => "events_pruned",
        }
    }
}

/// A persisted event row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id:          Option<i64>,
    pub occurred_at: EpochMillis,
    pub component:   String,
    pub event_type:  String,
    pub payload:     String,
}

impl EventLogEntry {
    pub fn new(
        occurred_at: EpochMillis,
        component: &str,
        event: &GateEvent,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: None,
            occurred_at,
            component: component.to_string(),
            event_type: event.type_name().to_string(),
            payload: serde_json::to_string(event)?,
        })
    }

    pub fn decode(&self) -> Result<GateEvent, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }
}

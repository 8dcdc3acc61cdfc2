//! Decision ledger — one row per decision, the durable source of truth.
//!
//! A decision is written twice in its life:
//!   1. `record_decision` when `evaluate` issues it (pending, no outcome).
//!   2. `record_outcome` when a validator submits ground truth. This is a
//!      single INSERT ... ON CONFLICT DO UPDATE statement: last write wins
//!      on the validated fields and no second row is ever created.
//!
//! Downstream aggregation (safety counters, arm statistics, context model)
//! is claimed per decision with `claim_downstream`, a compare-and-set on
//! `downstream_applied`. Only the first validated submission is counted,
//! and rows that were validated but never claimed can be replayed.
//!
//! The ledger does NOT order competing submissions by `validated_at`;
//! callers that need strict ordering must serialize externally.

use crate::{
    clock::GateClock,
    config::OutcomeConfig,
    error::{GateError, GateResult},
    store::{GateStore, ValidatedOutcome},
    types::{Action, ArmId, DecisionId, EpochMillis, StratumKey},
};
use serde::{Deserialize, Serialize};

/// The external model's output as received by `evaluate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub assessment_id:   String,
    pub stratum:         StratumKey,
    pub predicted_class: String,
    pub confidence:      f64,
    pub created_at:      EpochMillis,
}

/// A freshly issued decision, before any outcome exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub decision_id:       DecisionId,
    pub stratum:           StratumKey,
    pub experiment_id:     String,
    pub arm_id:            ArmId,
    pub assessment_id:     String,
    pub expected_accuracy: f64,
    pub predicted_class:   String,
    pub created_at:        EpochMillis,
}

/// A validated outcome to upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub decision_id:     DecisionId,
    pub stratum:         StratumKey,
    pub experiment_id:   String,
    pub arm_id:          ArmId,
    pub assessment_id:   String,
    pub reward:          f64,
    /// Was this a safety-relevant miss (false negative)?
    pub safety_flag:     bool,
    pub true_class:      String,
    pub predicted_class: String,
    pub validator_id:    String,
    pub validated_at:    EpochMillis,
}

/// A full ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub decision_id:        DecisionId,
    pub stratum:            StratumKey,
    pub experiment_id:      String,
    pub arm_id:             ArmId,
    pub action:             Action,
    pub assessment_id:      String,
    pub expected_accuracy:  Option<f64>,
    pub reward:             Option<f64>,
    pub safety_flag:        bool,
    pub predicted_class:    String,
    pub true_class:         Option<String>,
    pub validator_id:       Option<String>,
    pub validated_at:       Option<EpochMillis>,
    pub downstream_applied: bool,
    pub created_at:         EpochMillis,
    pub updated_at:         EpochMillis,
}

impl Decision {
    pub fn is_validated(&self) -> bool {
        self.validated_at.is_some()
    }

    /// The model was right: class matched and nothing dangerous was missed.
    pub fn was_correct(&self) -> Option<bool> {
        self.true_class
            .as_ref()
            .map(|t| *t == self.predicted_class && !self.safety_flag)
    }
}

pub struct DecisionLedger<'a> {
    store:  &'a GateStore,
    config: &'a OutcomeConfig,
    clock:  &'a GateClock,
}

impl<'a> DecisionLedger<'a> {
    pub fn new(store: &'a GateStore, config: &'a OutcomeConfig, clock: &'a GateClock) -> Self {
        Self { store, config, clock }
    }

    pub fn record_assessment(&self, assessment: &Assessment) -> GateResult<()> {
        self.validate_assessment(assessment)?;
        self.store.insert_assessment(assessment)
    }

    /// Domain checks on an incoming assessment. Pure; touches no storage.
    pub fn validate_assessment(&self, assessment: &Assessment) -> GateResult<()> {
        if !(assessment.confidence.is_finite() && (0.0..=1.0).contains(&assessment.confidence)) {
            return Err(GateError::Constraint(format!(
                "confidence {} outside [0, 1]",
                assessment.confidence
            )));
        }
        self.check_class(&assessment.predicted_class, "predicted_class")
    }

    pub fn get_assessment(&self, assessment_id: &str) -> GateResult<Assessment> {
        self.store
            .get_assessment(assessment_id)?
            .ok_or_else(|| GateError::NotFound {
                entity: "assessment",
                id: assessment_id.to_string(),
            })
    }

    /// Insert the pending row for a newly issued decision.
    pub fn record_decision(&self, record: &DecisionRecord) -> GateResult<Decision> {
        self.check_class(&record.predicted_class, "predicted_class")?;
        self.store.insert_decision(record)
    }

    /// Atomic insert-or-update of a validated outcome.
    ///
    /// Fails with Constraint (state unchanged) when reward or class labels
    /// are out of domain, and Validation when the experiment/arm or
    /// assessment does not exist.
    pub fn record_outcome(&self, outcome: &OutcomeRecord) -> GateResult<Decision> {
        self.validate_outcome(outcome)?;
        let decision = self.store.upsert_outcome(outcome, self.clock.now_millis())?;
        log::debug!(
            "ledger upsert decision={} stratum={} safety_flag={} validator={}",
            decision.decision_id,
            decision.stratum,
            decision.safety_flag,
            outcome.validator_id
        );
        Ok(decision)
    }

    pub fn get(&self, decision_id: &str) -> GateResult<Decision> {
        self.find(decision_id)?.ok_or_else(|| GateError::NotFound {
            entity: "decision",
            id: decision_id.to_string(),
        })
    }

    pub fn find(&self, decision_id: &str) -> GateResult<Option<Decision>> {
        self.store.get_decision(decision_id)
    }

    /// Compare-and-set the downstream marker. True for exactly one caller
    /// per validated decision.
    pub fn claim_downstream(&self, decision_id: &str) -> GateResult<bool> {
        self.store.claim_downstream(decision_id)
    }

    /// Validated rows whose downstream aggregation never completed.
    pub fn pending_downstream(&self, limit: usize) -> GateResult<Vec<Decision>> {
        self.store.pending_downstream(limit)
    }

    pub fn validated_between(
        &self,
        start: EpochMillis,
        end: EpochMillis,
    ) -> GateResult<Vec<ValidatedOutcome>> {
        self.store.validated_outcomes_between(start, end)
    }

    fn validate_outcome(&self, outcome: &OutcomeRecord) -> GateResult<()> {
        if outcome.decision_id.trim().is_empty() {
            return Err(GateError::Validation("decision_id must not be empty".into()));
        }
        if outcome.validator_id.trim().is_empty() {
            return Err(GateError::Validation("validator_id must not be empty".into()));
        }
        let (lo, hi) = (self.config.reward_min, self.config.reward_max);
        if !(outcome.reward.is_finite() && outcome.reward >= lo && outcome.reward <= hi) {
            return Err(GateError::Constraint(format!(
                "reward {} outside [{lo}, {hi}]",
                outcome.reward
            )));
        }
        self.check_class(&outcome.true_class, "true_class")?;
        self.check_class(&outcome.predicted_class, "predicted_class")?;
        Ok(())
    }

    fn check_class(&self, label: &str, field: &str) -> GateResult<()> {
        if self.config.class_labels.iter().any(|c| c == label) {
            Ok(())
        } else {
            Err(GateError::Constraint(format!("{field} '{label}' is not a known class")))
        }
    }
}

//! Seeded synthetic workload.
//!
//! Generates assessments and their validated ground truth for a handful of
//! strata with different error profiles, and drives them through a gate.
//! Used by the runner and by the determinism and concurrency tests.
//!
//! Class labels are read in configured order, mildest first. A wrong
//! prediction is a false negative when it understates a label in the upper
//! half of that order (the damage was worse than the model said).

use crate::{
    error::GateResult,
    gate::{Gate, OutcomeSubmission},
    rng::{StreamSlot, WorkloadRng},
    stratum::StratumContext,
    types::{Action, DecisionId, StratumState},
};
use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Rewards fed back to the bandit for each outcome kind.
pub const REWARD_AUTOMATED_CORRECT: f64 = 1.0;
pub const REWARD_AUTOMATED_WRONG: f64 = 0.0;
pub const REWARD_AUTOMATED_MISS: f64 = -1.0;
pub const REWARD_DEFERRED: f64 = 0.3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StratumProfile {
    pub context:    StratumContext,
    /// Probability the external model's prediction is wrong.
    pub error_rate: f64,
}

/// Four strata from very reliable to clearly unsafe.
pub fn default_profiles() -> Vec<StratumProfile> {
    vec![
        StratumProfile {
            context: StratumContext::new("residential", Some(1995), "london", "water_damage"),
            error_rate: 0.004,
        },
        StratumProfile {
            context: StratumContext::new("residential", Some(1932), "manchester", "structural_crack"),
            error_rate: 0.02,
        },
        StratumProfile {
            context: StratumContext::new("residential", Some(1890), "bristol", "water_damage"),
            error_rate: 0.08,
        },
        StratumProfile {
            context: StratumContext::new("commercial", Some(2016), "leeds", "electrical_hazard"),
            error_rate: 0.2,
        },
    ]
}

/// One generated assessment plus the ground truth a validator will report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticCase {
    pub decision_id:       DecisionId,
    pub context:           StratumContext,
    pub predicted_class:   String,
    pub confidence:        f64,
    pub true_class:        String,
    pub is_false_negative: bool,
}

impl SyntheticCase {
    pub fn is_correct(&self) -> bool {
        self.predicted_class == self.true_class
    }

    pub fn reward_for(&self, action: Action) -> f64 {
        match action {
            Action::Defer => REWARD_DEFERRED,
            Action::Automate if self.is_false_negative => REWARD_AUTOMATED_MISS,
            Action::Automate if self.is_correct() => REWARD_AUTOMATED_CORRECT,
            Action::Automate => REWARD_AUTOMATED_WRONG,
        }
    }

    pub fn submission(&self, validator_id: &str) -> OutcomeSubmission {
        OutcomeSubmission {
            decision_id:       self.decision_id.clone(),
            stratum_context:   self.context.clone(),
            reward:            0.0,
            is_false_negative: self.is_false_negative,
            true_class:        self.true_class.clone(),
            predicted_class:   self.predicted_class.clone(),
            validator_id:      validator_id.to_string(),
        }
    }
}

pub struct WorkloadGenerator {
    seed:       u64,
    lane:       u64,
    next_index: u64,
    profiles:   Vec<StratumProfile>,
    labels:     Vec<String>,
    strata:     WorkloadRng,
    label_rng:  WorkloadRng,
    confidence: WorkloadRng,
    errors:     WorkloadRng,
}

impl WorkloadGenerator {
    pub fn new(seed: u64, profiles: Vec<StratumProfile>, labels: Vec<String>) -> Self {
        Self::for_lane(seed, 0, profiles, labels)
    }

    /// Independent generator for one of several concurrent workers. Lane 0
    /// is the single-worker stream.
    pub fn for_lane(
        seed: u64,
        lane: u64,
        profiles: Vec<StratumProfile>,
        labels: Vec<String>,
    ) -> Self {
        let lane_seed = seed.wrapping_add(lane.wrapping_mul(0x632b_e59b_d9b4_e019));
        Self {
            seed,
            lane,
            next_index: 0,
            profiles,
            labels,
            strata: WorkloadRng::new(lane_seed, StreamSlot::Strata),
            label_rng: WorkloadRng::new(lane_seed, StreamSlot::Labels),
            confidence: WorkloadRng::new(lane_seed, StreamSlot::Confidence),
            errors: WorkloadRng::new(lane_seed, StreamSlot::Errors),
        }
    }

    pub fn next_case(&mut self) -> SyntheticCase {
        let index = self.next_index;
        self.next_index += 1;

        let profile = &self.profiles[self.strata.next_below(self.profiles.len() as u64) as usize];
        let n = self.labels.len() as u64;
        let truth = self.label_rng.next_below(n) as usize;
        let wrong = self.errors.chance(profile.error_rate);
        let predicted = if wrong && n > 1 {
            ((truth as u64 + 1 + self.label_rng.next_below(n - 1)) % n) as usize
        } else {
            truth
        };
        let confidence = if wrong {
            self.confidence.uniform(0.35, 0.9)
        } else {
            self.confidence.uniform(0.6, 1.0)
        };
        let severe = truth as u64 >= n / 2;

        SyntheticCase {
            decision_id: format!("wl-{:x}-{}-{index:08}", self.seed, self.lane),
            context: profile.context.clone(),
            predicted_class: self.labels[predicted].clone(),
            confidence,
            true_class: self.labels[truth].clone(),
            is_false_negative: wrong && predicted < truth && severe,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSummary {
    pub decisions:                 u64,
    pub automated:                 u64,
    pub deferred:                  u64,
    pub false_negatives:           u64,
    pub automated_false_negatives: u64,
    pub verified_strata:           usize,
    pub quarantined_strata:        usize,
}

/// Evaluate and validate `n` cases. A manual clock is advanced by `step`
/// per case so report windows see a realistic spread.
pub fn drive(
    gate: &Gate,
    generator: &mut WorkloadGenerator,
    n: u64,
    step: Duration,
) -> GateResult<WorkloadSummary> {
    let mut summary = WorkloadSummary::default();
    for _ in 0..n {
        let case = generator.next_case();
        let response = gate.evaluate_as(
            &case.decision_id,
            &case.context,
            &case.predicted_class,
            case.confidence,
        )?;

        let mut submission = case.submission("workload");
        submission.reward = case.reward_for(response.action);
        gate.submit_outcome(&submission)?;

        summary.decisions += 1;
        match response.action {
            Action::Automate => summary.automated += 1,
            Action::Defer => summary.deferred += 1,
        }
        if case.is_false_negative {
            summary.false_negatives += 1;
            if response.action == Action::Automate {
                summary.automated_false_negatives += 1;
            }
        }
        if gate.clock().is_manual() {
            gate.clock().advance(step);
        }
    }

    for status in gate.all_safety_statuses()? {
        if status.state == StratumState::Verified {
            summary.verified_strata += 1;
        }
        if status.quarantined {
            summary.quarantined_strata += 1;
        }
    }
    Ok(summary)
}

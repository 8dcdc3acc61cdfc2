//! Bandit policy / arm selector.
//!
//! Each stratum is a two-state machine:
//!
//!   unverified ──is_safe──▶ verified
//!       ▲                      │
//!       └──── !is_safe ────────┘   (safety demotion)
//!
//! Strata start unverified and only defer arms are eligible there.
//! `refresh_verdict` re-reads the counters from storage on every call, so
//! a demotion caused by a durably recorded false negative is seen by the
//! very next decision, never eventually.
//!
//! Among eligible arms the highest upper confidence bound wins:
//!   mean_reward + c * sqrt(ln N / n)
//! Unpulled arms score +∞. Ties go to the lowest arm_id.

use crate::{
    clock::GateClock,
    config::{ArmConfig, GateConfig},
    error::{GateError, GateResult},
    event::GateEvent,
    safety::{SafetyCounts, SafetyTracker},
    store::GateStore,
    types::{Action, ArmId, StratumKey, StratumState},
};
use serde::{Deserialize, Serialize};

const COMPONENT: &str = "policy";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmStats {
    pub arm_id:     ArmId,
    pub pulls:      i64,
    pub reward_sum: f64,
}

impl ArmStats {
    pub fn mean_reward(&self) -> f64 {
        if self.pulls == 0 {
            0.0
        } else {
            self.reward_sum / self.pulls as f64
        }
    }
}

/// Safety verdict for one stratum at decision time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyVerdict {
    pub stratum:     StratumKey,
    pub state:       StratumState,
    pub is_safe:     bool,
    pub upper_bound: f64,
    pub counts:      SafetyCounts,
    pub quarantined: bool,
    /// The check did not complete; the verdict is the fail-closed default.
    pub timed_out:   bool,
}

impl SafetyVerdict {
    /// What a stratum is treated as when its verdict could not be read.
    pub fn fail_closed(stratum: &str) -> Self {
        Self {
            stratum:     stratum.to_string(),
            state:       StratumState::Unverified,
            is_safe:     false,
            upper_bound: 1.0,
            counts:      SafetyCounts::default(),
            quarantined: false,
            timed_out:   true,
        }
    }

    pub fn allows_automation(&self) -> bool {
        self.is_safe && self.state == StratumState::Verified && !self.timed_out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmChoice {
    pub arm_id: ArmId,
    pub action: Action,
    /// UCB score of the chosen arm (+∞ for an unpulled arm).
    pub score:  f64,
}

/// Pure arm selection. `automation_allowed = false` restricts the choice to
/// defer arms. Returns None only when no arm is eligible.
pub fn select_arm(
    arms: &[ArmConfig],
    stats: &[ArmStats],
    automation_allowed: bool,
    exploration_c: f64,
) -> Option<ArmChoice> {
    let mut eligible: Vec<&ArmConfig> = arms
        .iter()
        .filter(|a| automation_allowed || a.action == Action::Defer)
        .collect();
    eligible.sort_by(|a, b| a.arm_id.cmp(&b.arm_id));

    let pulls_of = |arm_id: &str| {
        stats
            .iter()
            .find(|s| s.arm_id == arm_id)
            .cloned()
            .unwrap_or(ArmStats {
                arm_id: arm_id.to_string(),
                pulls: 0,
                reward_sum: 0.0,
            })
    };

    let total_pulls: f64 = eligible
        .iter()
        .map(|a| pulls_of(&a.arm_id).pulls as f64)
        .sum::<f64>()
        .max(1.0);

    let mut best: Option<ArmChoice> = None;
    for arm in eligible {
        let s = pulls_of(&arm.arm_id);
        let score = if s.pulls == 0 {
            f64::INFINITY
        } else {
            s.mean_reward() + exploration_c * (total_pulls.ln() / s.pulls as f64).sqrt()
        };
        // Strictly greater: on equal scores the earlier (lower) arm_id stays.
        let better = match &best {
            None => true,
            Some(b) => score > b.score,
        };
        if better {
            best = Some(ArmChoice {
                arm_id: arm.arm_id.clone(),
                action: arm.action,
                score,
            });
        }
    }
    best
}

pub struct BanditPolicy<'a> {
    store:  &'a GateStore,
    clock:  &'a GateClock,
    config: &'a GateConfig,
}

impl<'a> BanditPolicy<'a> {
    pub fn new(store: &'a GateStore, clock: &'a GateClock, config: &'a GateConfig) -> Self {
        Self { store, clock, config }
    }

    /// Idempotently register the configured experiment and its arms.
    pub fn register_experiment(&self) -> GateResult<()> {
        let exp = &self.config.policy.experiment;
        let arms: Vec<(String, Action)> = exp
            .arms
            .iter()
            .map(|a| (a.arm_id.clone(), a.action))
            .collect();
        self.store
            .register_experiment(&exp.experiment_id, &arms, self.clock.now_millis())
    }

    /// Re-evaluate `is_safe` on fresh counters and persist any transition.
    pub fn refresh_verdict(&self, stratum: &str) -> GateResult<SafetyVerdict> {
        let safety = &self.config.safety;
        let tracker = SafetyTracker::new(self.store, self.clock);
        let status = tracker.status(stratum, safety.threshold, safety.confidence)?;

        let desired = if status.is_safe {
            StratumState::Verified
        } else {
            StratumState::Unverified
        };

        if desired != status.state {
            let now = self.clock.now_millis();
            let moved = self
                .store
                .transition_state(stratum, status.state, desired, now)?;
            if moved {
                let event = match desired {
                    StratumState::Verified => {
                        log::info!(
                            "stratum={stratum} verified: upper_bound={:.4} n={}",
                            status.upper_bound,
                            status.total_automated
                        );
                        GateEvent::StratumVerified {
                            stratum: stratum.to_string(),
                            upper_bound: status.upper_bound,
                            total_automated: status.total_automated,
                        }
                    }
                    StratumState::Unverified => {
                        log::warn!(
                            "stratum={stratum} demoted: upper_bound={:.4} fn={} n={}",
                            status.upper_bound,
                            status.false_negatives,
                            status.total_automated
                        );
                        GateEvent::StratumDemoted {
                            stratum: stratum.to_string(),
                            upper_bound: status.upper_bound,
                            false_negatives: status.false_negatives,
                        }
                    }
                };
                self.store.record_event(now, COMPONENT, &event)?;
            }
        }

        Ok(SafetyVerdict {
            stratum:     stratum.to_string(),
            state:       desired,
            is_safe:     status.is_safe,
            upper_bound: status.upper_bound,
            counts:      SafetyCounts {
                total_automated: status.total_automated,
                false_negatives: status.false_negatives,
            },
            quarantined: status.quarantined,
            timed_out:   false,
        })
    }

    /// Pick an arm for one decision. Automation requires a verified stratum,
    /// enough model confidence and enough expected accuracy.
    pub fn choose(
        &self,
        verdict: &SafetyVerdict,
        confidence: f64,
        expected_accuracy: f64,
    ) -> GateResult<ArmChoice> {
        let p = &self.config.policy;
        let automation_allowed = verdict.allows_automation()
            && confidence >= p.min_confidence
            && expected_accuracy >= p.min_expected_accuracy;

        let stats = self.store.arm_stats(&verdict.stratum)?;
        select_arm(&p.experiment.arms, &stats, automation_allowed, p.exploration_c).ok_or_else(
            || GateError::Validation("experiment has no eligible arm".into()),
        )
    }

    pub fn record_arm_reward(&self, stratum: &str, arm_id: &str, reward: f64) -> GateResult<()> {
        self.store
            .record_arm_reward(stratum, arm_id, reward, self.clock.now_millis())
    }

    pub fn arm_stats(&self, stratum: &str) -> GateResult<Vec<ArmStats>> {
        self.store.arm_stats(stratum)
    }
}

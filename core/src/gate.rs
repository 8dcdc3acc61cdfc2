//! The gate facade — the boundary every caller goes through.
//!
//! DECISION PATH (`evaluate`):
//!   1. Derive the stratum key from the assessment context.
//!   2. Context model scores the assessment (expected accuracy).
//!   3. One IMMEDIATE transaction, begun under the short safety-check
//!      timeout: refresh the stratum verdict, pick an arm among the
//!      eligible ones, write assessment + pending ledger row + events.
//!   4. Timeout ⇒ fail closed: a defer is served even if its row has to
//!      wait in the unrecorded queue until the lock clears.
//!
//! OUTCOME PATH (`submit_outcome`):
//!   1. Upsert the validated outcome into the ledger (its own statement).
//!   2. Under the agent lock, in one transaction: claim the row, then apply
//!      safety counters, arm reward and the context model update.
//!   3. Refresh the stratum verdict so transitions are persisted promptly.
//!
//! RULES:
//!   - A downstream failure never rolls back the ledger write. The row stays
//!     claimable and `replay_pending` finishes it later.
//!   - Only the first validated submission of a decision is aggregated.
//!   - Every worker owns its own connection; only `GateShared` is shared.

use crate::{
    clock::GateClock,
    config::GateConfig,
    context_model::{encode_input, AgentLocks, ContextModel},
    error::{GateError, GateResult},
    event::GateEvent,
    ledger::{Assessment, Decision, DecisionLedger, DecisionRecord, OutcomeRecord},
    policy::{BanditPolicy, SafetyVerdict},
    reporter::{EffectivenessReport, EffectivenessReporter, ReportPeriod},
    safety::{SafetyStatus, SafetyTracker},
    store::GateStore,
    stratum::{stratum_key, StratumContext},
    types::{Action, ArmId, DecisionId, StratumKey},
};
use chrono::TimeZone;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const COMPONENT: &str = "gate";

/// Busy timeout for everything except the safety check.
pub const STORE_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// State shared by every worker of one gate.
#[derive(Debug)]
pub struct GateShared {
    pub config:      GateConfig,
    pub clock:       GateClock,
    pub agent_locks: AgentLocks,
    unrecorded:      Mutex<Vec<UnrecordedDecision>>,
}

/// A fail-closed decision served while the ledger was locked.
#[derive(Debug, Clone)]
struct UnrecordedDecision {
    assessment: Assessment,
    record:     DecisionRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluateResponse {
    pub decision_id: DecisionId,
    pub action:      Action,
    pub arm_id:      ArmId,
    pub stratum:     StratumKey,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeSubmission {
    pub decision_id:       DecisionId,
    pub stratum_context:   StratumContext,
    pub reward:            f64,
    pub is_false_negative: bool,
    pub true_class:        String,
    pub predicted_class:   String,
    pub validator_id:      String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeAck {
    pub decision_id:      DecisionId,
    /// False for a re-submission; the ledger row was updated but nothing
    /// was counted again.
    pub first_validation: bool,
}

pub struct Gate {
    shared: Arc<GateShared>,
    store:  GateStore,
}

impl Gate {
    /// Open (or create) a gate database file.
    pub fn open(path: &str, config: GateConfig, clock: GateClock) -> GateResult<Self> {
        Self::init(GateStore::open(path)?, config, clock)
    }

    pub fn in_memory(config: GateConfig, clock: GateClock) -> GateResult<Self> {
        Self::init(GateStore::in_memory()?, config, clock)
    }

    /// In-memory gate with the test config and a manual clock at a fixed epoch.
    pub fn build_test() -> GateResult<Self> {
        let start = chrono::Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_default();
        Self::in_memory(GateConfig::default_test(), GateClock::manual(start))
    }

    fn init(store: GateStore, config: GateConfig, clock: GateClock) -> GateResult<Self> {
        config.validate()?;
        store.set_busy_timeout(STORE_BUSY_TIMEOUT)?;
        store.migrate()?;
        let gate = Self {
            shared: Arc::new(GateShared {
                config,
                clock,
                agent_locks: AgentLocks::new(),
                unrecorded:  Mutex::new(Vec::new()),
            }),
            store,
        };
        gate.policy().register_experiment()?;
        gate.ensure_context()?;
        Ok(gate)
    }

    /// A new handle on the same database with its own connection. Share the
    /// returned gate with exactly one thread.
    pub fn worker(&self) -> GateResult<Self> {
        if self.store.path().is_none() {
            return Err(GateError::Validation(
                "in-memory gates cannot hand out worker connections".into(),
            ));
        }
        let store = self.store.reopen()?;
        store.set_busy_timeout(STORE_BUSY_TIMEOUT)?;
        Ok(Self {
            shared: Arc::clone(&self.shared),
            store,
        })
    }

    pub fn config(&self) -> &GateConfig {
        &self.shared.config
    }

    pub fn clock(&self) -> &GateClock {
        &self.shared.clock
    }

    pub fn store(&self) -> &GateStore {
        &self.store
    }

    pub fn agent(&self) -> &str {
        &self.shared.config.agent_name
    }

    // ── Components ─────────────────────────────────────────────

    pub fn ledger(&self) -> DecisionLedger<'_> {
        DecisionLedger::new(&self.store, &self.shared.config.outcome, &self.shared.clock)
    }

    pub fn tracker(&self) -> SafetyTracker<'_> {
        SafetyTracker::new(&self.store, &self.shared.clock)
    }

    pub fn policy(&self) -> BanditPolicy<'_> {
        BanditPolicy::new(&self.store, &self.shared.clock, &self.shared.config)
    }

    pub fn reporter(&self) -> EffectivenessReporter<'_> {
        EffectivenessReporter::new(&self.store, &self.shared.clock, &self.shared.config)
    }

    // ── Decision path ──────────────────────────────────────────

    /// Decide automate-or-defer for one assessment. The decision id is a
    /// fresh UUID v4.
    pub fn evaluate(
        &self,
        ctx: &StratumContext,
        prediction: &str,
        confidence: f64,
    ) -> GateResult<EvaluateResponse> {
        self.evaluate_as(&uuid::Uuid::new_v4().to_string(), ctx, prediction, confidence)
    }

    /// `evaluate` with a caller-supplied decision id. An id that already
    /// exists is a Validation error.
    pub fn evaluate_as(
        &self,
        decision_id: &str,
        ctx: &StratumContext,
        prediction: &str,
        confidence: f64,
    ) -> GateResult<EvaluateResponse> {
        if decision_id.trim().is_empty() {
            return Err(GateError::Validation("decision_id must not be empty".into()));
        }
        ctx.validate()?;
        let stratum = stratum_key(ctx);
        let now = self.clock().now_millis();
        let assessment = Assessment {
            assessment_id:   decision_id.to_string(),
            stratum:         stratum.clone(),
            predicted_class: prediction.to_string(),
            confidence,
            created_at:      now,
        };
        self.ledger().validate_assessment(&assessment)?;

        let model = self.current_model()?;
        let input = encode_input(&stratum, prediction, confidence, model.input_dim());
        let expected_accuracy = model.expected_accuracy(&input)?;

        // Verdict read and decision write share one IMMEDIATE transaction, so
        // a demotion committed by another worker is never missed in between.
        let issued = self.with_safety_lock(&stratum, |store, verdict| {
            let choice = self.policy().choose(&verdict, confidence, expected_accuracy)?;
            let record = self.decision_record(&assessment, &choice.arm_id, expected_accuracy);
            let decision = self.write_decision(store, &assessment, &record, false)?;
            Ok((decision, verdict.upper_bound))
        });

        let (decision, upper_bound) = match issued {
            Ok(issued) => issued,
            Err(GateError::Timeout { stratum }) => {
                log::warn!("stratum={stratum} safety check timed out; deferring");
                return self.issue_fail_closed(&assessment, expected_accuracy);
            }
            Err(e) => return Err(e),
        };

        log::debug!(
            "decision={} stratum={stratum} arm={} action={} expected_accuracy={expected_accuracy:.3} ub={upper_bound:.4}",
            decision.decision_id,
            decision.arm_id,
            decision.action.as_str()
        );

        Ok(EvaluateResponse {
            decision_id: decision.decision_id,
            action:      decision.action,
            arm_id:      decision.arm_id,
            stratum,
        })
    }

    /// Fresh safety verdict under the short busy timeout. A busy or locked
    /// database becomes `GateError::Timeout`.
    pub fn check_safety(&self, stratum: &str) -> GateResult<SafetyVerdict> {
        self.with_safety_lock(stratum, |_, verdict| Ok(verdict))
    }

    /// Take the write lock under `safety_check_timeout_ms`, refresh the
    /// stratum's verdict and hand it to `f` inside the same transaction.
    fn with_safety_lock<T>(
        &self,
        stratum: &str,
        f: impl FnOnce(&GateStore, SafetyVerdict) -> GateResult<T>,
    ) -> GateResult<T> {
        let timeout = Duration::from_millis(self.config().safety.safety_check_timeout_ms);
        self.store.set_busy_timeout(timeout)?;
        let result = self.store.with_transaction(|store| {
            store.ensure_stratum(stratum, self.clock().now_millis())?;
            let verdict = self.policy().refresh_verdict(stratum)?;
            f(store, verdict)
        });
        self.store.set_busy_timeout(STORE_BUSY_TIMEOUT)?;

        result.map_err(|e| {
            if e.is_busy() {
                GateError::Timeout { stratum: stratum.to_string() }
            } else {
                e
            }
        })
    }

    /// Serve a defer for an assessment whose safety check timed out. The row
    /// is written under the short timeout; if the lock is still held it is
    /// queued for `flush_unrecorded` and the defer is returned regardless.
    fn issue_fail_closed(
        &self,
        assessment: &Assessment,
        expected_accuracy: f64,
    ) -> GateResult<EvaluateResponse> {
        let verdict = SafetyVerdict::fail_closed(&assessment.stratum);
        let choice = self
            .policy()
            .choose(&verdict, assessment.confidence, expected_accuracy)?;
        let record = self.decision_record(assessment, &choice.arm_id, expected_accuracy);

        let timeout = Duration::from_millis(self.config().safety.safety_check_timeout_ms);
        self.store.set_busy_timeout(timeout)?;
        let written = self
            .store
            .with_transaction(|store| self.write_decision(store, assessment, &record, true));
        self.store.set_busy_timeout(STORE_BUSY_TIMEOUT)?;

        match written {
            Ok(_) => {}
            Err(e) if e.is_busy() => {
                log::warn!(
                    "decision={} stratum={} ledger still locked; write queued",
                    record.decision_id,
                    record.stratum
                );
                self.shared.unrecorded.lock().push(UnrecordedDecision {
                    assessment: assessment.clone(),
                    record:     record.clone(),
                });
            }
            Err(e) => return Err(e),
        }

        Ok(EvaluateResponse {
            decision_id: record.decision_id,
            action:      choice.action,
            arm_id:      record.arm_id,
            stratum:     record.stratum,
        })
    }

    /// Write fail-closed decisions that were served while the database was
    /// locked. Returns how many rows were written. A rejected row (for
    /// example a duplicate id) is logged and dropped.
    pub fn flush_unrecorded(&self) -> GateResult<usize> {
        let mut queue = self.shared.unrecorded.lock();
        let mut written = 0;
        while let Some(item) = queue.first().cloned() {
            let result = self.store.with_transaction(|store| {
                self.write_decision(store, &item.assessment, &item.record, true)
            });
            match result {
                Ok(_) => written += 1,
                Err(e) if e.is_busy() => return Err(e),
                Err(e) => log::warn!(
                    "decision={} dropped from the unrecorded queue: {e}",
                    item.record.decision_id
                ),
            }
            queue.remove(0);
        }
        if written > 0 {
            log::info!("wrote {written} queued fail-closed decisions");
        }
        Ok(written)
    }

    pub fn unrecorded_count(&self) -> usize {
        self.shared.unrecorded.lock().len()
    }

    fn decision_record(
        &self,
        assessment: &Assessment,
        arm_id: &str,
        expected_accuracy: f64,
    ) -> DecisionRecord {
        DecisionRecord {
            decision_id: assessment.assessment_id.clone(),
            stratum: assessment.stratum.clone(),
            experiment_id: self.config().policy.experiment.experiment_id.clone(),
            arm_id: arm_id.to_string(),
            assessment_id: assessment.assessment_id.clone(),
            expected_accuracy,
            predicted_class: assessment.predicted_class.clone(),
            created_at: assessment.created_at,
        }
    }

    /// Assessment, pending ledger row and events. Runs inside the caller's
    /// transaction.
    fn write_decision(
        &self,
        store: &GateStore,
        assessment: &Assessment,
        record: &DecisionRecord,
        timed_out: bool,
    ) -> GateResult<Decision> {
        let ledger = self.ledger();
        ledger.record_assessment(assessment)?;
        let decision = ledger.record_decision(record)?;
        if timed_out {
            store.record_event(
                record.created_at,
                COMPONENT,
                &GateEvent::SafetyCheckTimedOut { stratum: record.stratum.clone() },
            )?;
        }
        store.record_event(
            record.created_at,
            COMPONENT,
            &GateEvent::DecisionIssued {
                decision_id: decision.decision_id.clone(),
                stratum: record.stratum.clone(),
                arm_id: decision.arm_id.clone(),
                action: decision.action.as_str().to_string(),
            },
        )?;
        Ok(decision)
    }

    // ── Outcome path ───────────────────────────────────────────

    /// Record ground truth for an issued decision. Idempotent: repeating a
    /// submission updates the ledger row in place and counts nothing twice.
    pub fn submit_outcome(&self, sub: &OutcomeSubmission) -> GateResult<OutcomeAck> {
        if sub.decision_id.trim().is_empty() {
            return Err(GateError::Validation("decision_id must not be empty".into()));
        }
        sub.stratum_context.validate()?;
        let stratum = stratum_key(&sub.stratum_context);

        // A fail-closed decision may still be waiting for its ledger row.
        self.flush_unrecorded()?;

        let ledger = self.ledger();
        let issued = ledger.find(&sub.decision_id)?.ok_or_else(|| {
            GateError::Validation(format!("decision {} was never issued", sub.decision_id))
        })?;
        if issued.stratum != stratum {
            return Err(GateError::Validation(format!(
                "decision {} belongs to stratum {}, not {stratum}",
                sub.decision_id, issued.stratum
            )));
        }

        let outcome = OutcomeRecord {
            decision_id:     issued.decision_id.clone(),
            stratum:         issued.stratum.clone(),
            experiment_id:   issued.experiment_id.clone(),
            arm_id:          issued.arm_id.clone(),
            assessment_id:   issued.assessment_id.clone(),
            reward:          sub.reward,
            safety_flag:     sub.is_false_negative,
            true_class:      sub.true_class.clone(),
            predicted_class: sub.predicted_class.clone(),
            validator_id:    sub.validator_id.clone(),
            validated_at:    self.clock().now_millis(),
        };
        let decision = ledger.record_outcome(&outcome)?;

        let first_validation = self.apply_downstream(&decision)?;
        if first_validation {
            if let Err(e) = self.policy().refresh_verdict(&decision.stratum) {
                log::warn!("stratum={} verdict refresh after outcome failed: {e}", decision.stratum);
            }
        } else {
            log::debug!("decision={} re-submitted; counters untouched", decision.decision_id);
        }

        Ok(OutcomeAck {
            decision_id: decision.decision_id,
            first_validation,
        })
    }

    /// Claim and aggregate one validated ledger row. Returns false when the
    /// row was already claimed. On an integrity failure the transaction is
    /// rolled back, the stratum quarantined and the row left claimable.
    fn apply_downstream(&self, decision: &Decision) -> GateResult<bool> {
        let lock = self.shared.agent_locks.handle(self.agent());
        let _guard = lock.lock();

        let result = self
            .store
            .with_transaction(|store| self.aggregate_claimed(store, decision));

        match result {
            Err(GateError::Integrity { stratum, detail }) => {
                self.tracker().quarantine(&stratum, &detail)?;
                Err(GateError::Integrity { stratum, detail })
            }
            other => other,
        }
    }

    fn aggregate_claimed(&self, store: &GateStore, decision: &Decision) -> GateResult<bool> {
        let now = self.clock().now_millis();
        if !store.claim_downstream(&decision.decision_id)? {
            store.record_event(
                now,
                COMPONENT,
                &GateEvent::OutcomeRecorded {
                    decision_id: decision.decision_id.clone(),
                    stratum: decision.stratum.clone(),
                    first_validation: false,
                    is_false_negative: decision.safety_flag,
                },
            )?;
            return Ok(false);
        }

        // Safety counters.
        let counted = decision.action == Action::Automate
            || self.config().safety.count_deferred_outcomes;
        if counted {
            let tracker = self.tracker();
            tracker.record_automated_decision(&decision.stratum)?;
            if decision.safety_flag {
                tracker.try_record_false_negative(&decision.stratum)?;
            }
        }

        // Arm statistics.
        let reward = decision.reward.unwrap_or(0.0);
        self.policy()
            .record_arm_reward(&decision.stratum, &decision.arm_id, reward)?;

        // Context model.
        let assessment = self.ledger().get_assessment(&decision.assessment_id)?;
        let cfg = &self.config().context_model;
        let mut model = self.current_model()?;
        let input = encode_input(
            &decision.stratum,
            &assessment.predicted_class,
            assessment.confidence,
            model.input_dim(),
        );
        let expected = match decision.expected_accuracy {
            Some(p) => p,
            None => model.expected_accuracy(&input)?,
        };
        let correct = if decision.was_correct().unwrap_or(false) { 1.0 } else { 0.0 };
        model.update(&input, expected - correct, cfg.learning_rate)?;
        store.save_context(&model, now)?;
        if model.update_count() % cfg.snapshot_interval.max(1) == 0 {
            let version = store.append_context_snapshot(&model, now)?;
            store.record_event(
                now,
                COMPONENT,
                &GateEvent::ContextSnapshotTaken {
                    agent: model.agent().to_string(),
                    version,
                },
            )?;
        }

        store.record_event(
            now,
            COMPONENT,
            &GateEvent::OutcomeRecorded {
                decision_id: decision.decision_id.clone(),
                stratum: decision.stratum.clone(),
                first_validation: true,
                is_false_negative: decision.safety_flag,
            },
        )?;
        Ok(true)
    }

    // ── Context model state ────────────────────────────────────

    /// Stored model for the configured agent, or the neutral one.
    pub fn current_model(&self) -> GateResult<ContextModel> {
        let cfg = &self.config().context_model;
        Ok(self
            .store
            .load_context(self.agent(), cfg.memory_capacity)?
            .unwrap_or_else(|| ContextModel::neutral(self.agent(), cfg)))
    }

    /// Persist the neutral model and its version-0 snapshot if the agent has
    /// no state yet.
    fn ensure_context(&self) -> GateResult<()> {
        let cfg = &self.config().context_model;
        let lock = self.shared.agent_locks.handle(self.agent());
        let _guard = lock.lock();
        self.store.with_transaction(|store| {
            if store.load_context(self.agent(), cfg.memory_capacity)?.is_some() {
                return Ok(());
            }
            let now = self.clock().now_millis();
            let model = ContextModel::neutral(self.agent(), cfg);
            store.save_context(&model, now)?;
            let version = store.append_context_snapshot(&model, now)?;
            store.record_event(
                now,
                COMPONENT,
                &GateEvent::ContextSnapshotTaken {
                    agent: self.agent().to_string(),
                    version,
                },
            )?;
            log::info!("agent={} context model initialised", self.agent());
            Ok(())
        })
    }

    // ── Read side ──────────────────────────────────────────────

    pub fn get_safety_status(&self, stratum: &str) -> GateResult<SafetyStatus> {
        let s = &self.config().safety;
        self.tracker().status(stratum, s.threshold, s.confidence)
    }

    pub fn get_effectiveness_report(
        &self,
        agent: &str,
        period: &ReportPeriod,
    ) -> GateResult<EffectivenessReport> {
        self.reporter().latest(agent, period)
    }

    pub fn generate_report(
        &self,
        agent: &str,
        period: &ReportPeriod,
    ) -> GateResult<EffectivenessReport> {
        self.reporter().generate(agent, period)
    }

    pub fn all_safety_statuses(&self) -> GateResult<Vec<SafetyStatus>> {
        self.store
            .all_safety_rows()?
            .iter()
            .map(|row| self.get_safety_status(&row.stratum))
            .collect()
    }

    // ── Admin ──────────────────────────────────────────────────

    pub fn reset_stratum(&self, stratum: &str) -> GateResult<bool> {
        self.tracker().reset(stratum)
    }

    pub fn reconcile_stratum(&self, stratum: &str) -> GateResult<bool> {
        self.tracker().reconcile(stratum)
    }

    /// Finish downstream aggregation for validated rows that never completed
    /// it. Integrity failures quarantine their stratum and are skipped.
    pub fn replay_pending(&self, limit: usize) -> GateResult<usize> {
        let pending = self.ledger().pending_downstream(limit)?;
        let mut replayed = 0;
        for decision in &pending {
            match self.apply_downstream(decision) {
                Ok(true) => {
                    replayed += 1;
                    self.store.record_event(
                        self.clock().now_millis(),
                        COMPONENT,
                        &GateEvent::DownstreamReplayed {
                            decision_id: decision.decision_id.clone(),
                        },
                    )?;
                    if let Err(e) = self.policy().refresh_verdict(&decision.stratum) {
                        log::warn!("stratum={} verdict refresh after replay failed: {e}", decision.stratum);
                    }
                }
                Ok(false) => {}
                Err(GateError::Integrity { stratum, .. }) => {
                    log::warn!("decision={} left pending; stratum={stratum} quarantined", decision.decision_id);
                }
                Err(e) => return Err(e),
            }
        }
        if replayed > 0 {
            log::info!("replayed downstream aggregation for {replayed} decisions");
        }
        Ok(replayed)
    }
}

//! Decision ledger — idempotent upsert and error taxonomy through the gate.

use gatekeeper_core::{
    error::GateError,
    gate::{Gate, OutcomeSubmission},
    ledger::{Assessment, OutcomeRecord},
    stratum::{stratum_key, StratumContext},
    types::Action,
};

fn ctx() -> StratumContext {
    StratumContext::new("residential", Some(1995), "london", "water_damage")
}

fn submission(decision_id: &str) -> OutcomeSubmission {
    OutcomeSubmission {
        decision_id: decision_id.to_string(),
        stratum_context: ctx(),
        reward: 0.3,
        is_false_negative: false,
        true_class: "water_damage".into(),
        predicted_class: "water_damage".into(),
        validator_id: "adjuster-7".into(),
    }
}

#[test]
fn evaluate_writes_one_pending_row() {
    let gate = Gate::build_test().unwrap();
    let resp = gate.evaluate(&ctx(), "water_damage", 0.9).unwrap();

    assert_eq!(resp.stratum, stratum_key(&ctx()));
    assert_eq!(resp.action, Action::Defer, "a new stratum starts unverified");

    let row = gate.ledger().get(&resp.decision_id).unwrap();
    assert!(!row.is_validated());
    assert!(!row.downstream_applied);
    assert_eq!(row.arm_id, resp.arm_id);
    assert!(row.expected_accuracy.is_some());
    assert_eq!(gate.store().events_of_type("decision_issued").unwrap().len(), 1);
}

#[test]
fn identical_submission_twice_counts_once() {
    let gate = Gate::build_test().unwrap();
    let resp = gate.evaluate(&ctx(), "water_damage", 0.9).unwrap();

    let first = gate.submit_outcome(&submission(&resp.decision_id)).unwrap();
    let second = gate.submit_outcome(&submission(&resp.decision_id)).unwrap();

    assert!(first.first_validation);
    assert!(!second.first_validation);
    assert_eq!(gate.store().decision_count_for(&resp.decision_id).unwrap(), 1);
    assert_eq!(gate.store().decision_count().unwrap(), 1);

    let status = gate.get_safety_status(&resp.stratum).unwrap();
    assert_eq!(status.total_automated, 1, "counted exactly once");

    let arms = gate.policy().arm_stats(&resp.stratum).unwrap();
    let pulls: i64 = arms.iter().map(|a| a.pulls).sum();
    assert_eq!(pulls, 1);
    assert_eq!(gate.current_model().unwrap().update_count(), 1);
}

#[test]
fn resubmission_overwrites_fields_last_write_wins() {
    let gate = Gate::build_test().unwrap();
    let resp = gate.evaluate(&ctx(), "water_damage", 0.9).unwrap();
    gate.submit_outcome(&submission(&resp.decision_id)).unwrap();

    let mut corrected = submission(&resp.decision_id);
    corrected.true_class = "structural_crack".into();
    corrected.validator_id = "senior-adjuster-2".into();
    corrected.reward = -0.5;
    gate.submit_outcome(&corrected).unwrap();

    let row = gate.ledger().get(&resp.decision_id).unwrap();
    assert_eq!(row.true_class.as_deref(), Some("structural_crack"));
    assert_eq!(row.validator_id.as_deref(), Some("senior-adjuster-2"));
    assert_eq!(row.reward, Some(-0.5));
    assert_eq!(row.was_correct(), Some(false));
    assert_eq!(gate.store().decision_count().unwrap(), 1);
}

#[test]
fn unknown_decision_is_validation_error() {
    let gate = Gate::build_test().unwrap();
    let err = gate.submit_outcome(&submission("does-not-exist")).unwrap_err();
    assert!(matches!(err, GateError::Validation(_)), "got {err:?}");
    assert_eq!(gate.store().decision_count().unwrap(), 0);
}

#[test]
fn stratum_mismatch_is_validation_error() {
    let gate = Gate::build_test().unwrap();
    let resp = gate.evaluate(&ctx(), "water_damage", 0.9).unwrap();

    let mut sub = submission(&resp.decision_id);
    sub.stratum_context = StratumContext::new("commercial", Some(1995), "london", "water_damage");
    let err = gate.submit_outcome(&sub).unwrap_err();
    assert!(matches!(err, GateError::Validation(_)), "got {err:?}");
    assert!(!gate.ledger().get(&resp.decision_id).unwrap().is_validated());
}

#[test]
fn out_of_domain_values_are_constraint_errors_with_state_unchanged() {
    let gate = Gate::build_test().unwrap();
    let resp = gate.evaluate(&ctx(), "water_damage", 0.9).unwrap();

    let mut high_reward = submission(&resp.decision_id);
    high_reward.reward = 4.0;
    let err = gate.submit_outcome(&high_reward).unwrap_err();
    assert!(matches!(err, GateError::Constraint(_)), "got {err:?}");

    let mut bad_label = submission(&resp.decision_id);
    bad_label.true_class = "meteor_strike".into();
    let err = gate.submit_outcome(&bad_label).unwrap_err();
    assert!(matches!(err, GateError::Constraint(_)), "got {err:?}");

    let mut nan_reward = submission(&resp.decision_id);
    nan_reward.reward = f64::NAN;
    assert!(matches!(
        gate.submit_outcome(&nan_reward),
        Err(GateError::Constraint(_))
    ));

    let row = gate.ledger().get(&resp.decision_id).unwrap();
    assert!(!row.is_validated());
    assert_eq!(gate.get_safety_status(&resp.stratum).unwrap().total_automated, 0);
}

#[test]
fn evaluate_rejects_bad_inputs() {
    let gate = Gate::build_test().unwrap();

    let err = gate.evaluate(&ctx(), "water_damage", 1.5).unwrap_err();
    assert!(matches!(err, GateError::Constraint(_)), "got {err:?}");

    let err = gate.evaluate(&ctx(), "unicorn", 0.9).unwrap_err();
    assert!(matches!(err, GateError::Constraint(_)), "got {err:?}");

    let empty = StratumContext::new("", None, "london", "water_damage");
    let err = gate.evaluate(&empty, "water_damage", 0.9).unwrap_err();
    assert!(matches!(err, GateError::Validation(_)), "got {err:?}");

    assert_eq!(gate.store().decision_count().unwrap(), 0);
}

#[test]
fn duplicate_decision_id_is_validation_error() {
    let gate = Gate::build_test().unwrap();
    gate.evaluate_as("claim-1", &ctx(), "water_damage", 0.9).unwrap();
    let err = gate
        .evaluate_as("claim-1", &ctx(), "water_damage", 0.9)
        .unwrap_err();
    assert!(matches!(err, GateError::Validation(_)), "got {err:?}");
    assert_eq!(gate.store().decision_count().unwrap(), 1);
}

#[test]
fn upsert_creates_row_when_absent_and_checks_references() {
    let gate = Gate::build_test().unwrap();
    let ledger = gate.ledger();
    let stratum = stratum_key(&ctx());
    let now = gate.clock().now_millis();

    ledger
        .record_assessment(&Assessment {
            assessment_id: "asm-1".into(),
            stratum: stratum.clone(),
            predicted_class: "cosmetic".into(),
            confidence: 0.7,
            created_at: now,
        })
        .unwrap();

    let outcome = OutcomeRecord {
        decision_id: "backfilled-1".into(),
        stratum: stratum.clone(),
        experiment_id: "automation_gate_v1".into(),
        arm_id: "human_review".into(),
        assessment_id: "asm-1".into(),
        reward: 0.3,
        safety_flag: false,
        true_class: "cosmetic".into(),
        predicted_class: "cosmetic".into(),
        validator_id: "import".into(),
        validated_at: now,
    };
    let row = ledger.record_outcome(&outcome).unwrap();
    assert_eq!(row.action, Action::Defer);
    assert!(row.is_validated());
    assert_eq!(ledger.pending_downstream(10).unwrap().len(), 1);

    let mut unknown_arm = outcome.clone();
    unknown_arm.decision_id = "backfilled-2".into();
    unknown_arm.arm_id = "no_such_arm".into();
    assert!(matches!(
        ledger.record_outcome(&unknown_arm),
        Err(GateError::Validation(_))
    ));

    let mut unknown_assessment = outcome;
    unknown_assessment.decision_id = "backfilled-3".into();
    unknown_assessment.assessment_id = "asm-missing".into();
    assert!(matches!(
        ledger.record_outcome(&unknown_assessment),
        Err(GateError::Validation(_))
    ));

    assert_eq!(gate.store().decision_count().unwrap(), 1);
}

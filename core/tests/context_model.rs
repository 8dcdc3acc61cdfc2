//! Self-modifying context model as driven by the gate.

use gatekeeper_core::{
    config::GateConfig,
    context_model::{encode_input, AgentLocks, ContextInput, ContextModel},
    error::GateError,
    gate::{Gate, OutcomeSubmission},
    stratum::StratumContext,
};
use std::sync::Arc;

fn ctx() -> StratumContext {
    StratumContext::new("residential", Some(1960), "cardiff", "water_damage")
}

fn validate(gate: &Gate, correct: bool) {
    let resp = gate.evaluate(&ctx(), "water_damage", 0.8).unwrap();
    gate.submit_outcome(&OutcomeSubmission {
        decision_id: resp.decision_id,
        stratum_context: ctx(),
        reward: 0.3,
        is_false_negative: false,
        true_class: if correct { "water_damage" } else { "cosmetic" }.into(),
        predicted_class: "water_damage".into(),
        validator_id: "v".into(),
    })
    .unwrap();
}

#[test]
fn gate_starts_with_neutral_model_and_version_zero() {
    let gate = Gate::build_test().unwrap();
    let model = gate.current_model().unwrap();
    let neutral = ContextModel::neutral(gate.agent(), &gate.config().context_model);

    assert_eq!(model.parameter_vector(), neutral.parameter_vector());
    assert_eq!(model.update_count(), 0);
    assert!(model.memory().is_empty());

    let snap = gate.store().earliest_context_snapshot(gate.agent()).unwrap().unwrap();
    assert_eq!(snap.version, 0);
    assert_eq!(snap.parameters, neutral.parameter_vector());
}

#[test]
fn correct_outcomes_raise_expected_accuracy() {
    let gate = Gate::build_test().unwrap();
    let dim = gate.config().context_model.input_dim;
    let input = encode_input("residential_postwar_cardiff_water_damage", "water_damage", 0.8, dim);

    let before = gate.current_model().unwrap().expected_accuracy(&input).unwrap();
    for _ in 0..30 {
        validate(&gate, true);
    }
    let after = gate.current_model().unwrap().expected_accuracy(&input).unwrap();
    assert!(after > before, "expected accuracy should rise: {before} -> {after}");
}

#[test]
fn memory_is_a_bounded_fifo() {
    let gate = Gate::build_test().unwrap();
    let capacity = gate.config().context_model.memory_capacity;
    for i in 0..capacity + 4 {
        validate(&gate, i % 3 != 0);
    }
    let model = gate.current_model().unwrap();
    assert_eq!(model.update_count(), (capacity + 4) as u64);
    assert_eq!(model.memory().len(), capacity);

    // snapshot_interval = 1 in the test config, plus the version-0 snapshot.
    assert_eq!(
        gate.store().context_snapshot_count(gate.agent()).unwrap(),
        (capacity + 5) as i64
    );
}

#[test]
fn malformed_update_leaves_state_byte_for_byte_unchanged() {
    let config = GateConfig::default_test();
    let mut model = ContextModel::neutral("agent", &config.context_model);
    let good = encode_input("s", "cosmetic", 0.7, config.context_model.input_dim);
    model.update(&good, 0.4, 0.1).unwrap();
    let before = model.clone();

    let short = ContextInput { key: "s".into(), values: vec![0.5; 3] };
    assert!(matches!(model.update(&short, 0.4, 0.1), Err(GateError::Shape(_))));

    let mut nan = good.clone();
    nan.values[0] = f64::NAN;
    assert!(matches!(model.update(&nan, 0.4, 0.1), Err(GateError::Shape(_))));

    assert!(matches!(
        model.update(&good, f64::INFINITY, 0.1),
        Err(GateError::Shape(_))
    ));

    assert_eq!(model, before);
    let bits = |m: &ContextModel| m.parameter_vector().iter().map(|v| v.to_bits()).collect::<Vec<_>>();
    assert_eq!(bits(&model), bits(&before));
}

#[test]
fn state_survives_reopening_the_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ctx.db");
    let path = path.to_str().unwrap();
    let clock = gatekeeper_core::clock::GateClock::system();

    let params = {
        let gate = Gate::open(path, GateConfig::default_test(), clock.clone()).unwrap();
        for _ in 0..5 {
            validate(&gate, true);
        }
        gate.current_model().unwrap().parameter_vector()
    };

    let gate = Gate::open(path, GateConfig::default_test(), clock).unwrap();
    let model = gate.current_model().unwrap();
    assert_eq!(model.update_count(), 5);
    assert_eq!(model.parameter_vector(), params, "reopen must not reinitialise");
}

#[test]
fn agent_locks_hand_out_one_lock_per_agent() {
    let locks = AgentLocks::new();
    let a1 = locks.handle("a");
    let a2 = locks.clone().handle("a");
    let b = locks.handle("b");
    assert!(Arc::ptr_eq(&a1, &a2));
    assert!(!Arc::ptr_eq(&a1, &b));
}

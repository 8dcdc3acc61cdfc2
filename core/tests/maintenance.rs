//! Maintenance runner — pruning, downstream replay, scheduled reports.

use chrono::Duration;
use gatekeeper_core::{
    config::GateConfig,
    clock::GateClock,
    gate::Gate,
    ledger::OutcomeRecord,
    maintenance::MaintenanceRunner,
    stratum::StratumContext,
};

fn ctx() -> StratumContext {
    StratumContext::new("residential", Some(1950), "derby", "water_damage")
}

/// Issue a decision and write its outcome to the ledger only, as if the
/// process died before downstream aggregation ran.
fn validated_but_not_aggregated(gate: &Gate) -> String {
    let resp = gate.evaluate(&ctx(), "water_damage", 0.9).unwrap();
    let issued = gate.ledger().get(&resp.decision_id).unwrap();
    gate.ledger()
        .record_outcome(&OutcomeRecord {
            decision_id: issued.decision_id.clone(),
            stratum: issued.stratum.clone(),
            experiment_id: issued.experiment_id.clone(),
            arm_id: issued.arm_id.clone(),
            assessment_id: issued.assessment_id.clone(),
            reward: 0.3,
            safety_flag: false,
            true_class: "water_damage".into(),
            predicted_class: "water_damage".into(),
            validator_id: "batch-import".into(),
            validated_at: gate.clock().now_millis(),
        })
        .unwrap();
    resp.decision_id
}

#[test]
fn pass_replays_pending_downstream_once() {
    let runner = MaintenanceRunner::new(Gate::build_test().unwrap());
    let gate = runner.gate();
    let id = validated_but_not_aggregated(gate);
    assert_eq!(gate.ledger().pending_downstream(10).unwrap().len(), 1);

    let first = runner.run_once().unwrap();
    assert_eq!(first.outcomes_replayed, 1);
    assert!(gate.ledger().get(&id).unwrap().downstream_applied);
    let stratum = gate.ledger().get(&id).unwrap().stratum;
    assert_eq!(gate.get_safety_status(&stratum).unwrap().total_automated, 1);
    assert_eq!(gate.store().events_of_type("downstream_replayed").unwrap().len(), 1);

    let second = runner.run_once().unwrap();
    assert_eq!(second.outcomes_replayed, 0);
    assert_eq!(gate.get_safety_status(&stratum).unwrap().total_automated, 1);
}

#[test]
fn pass_appends_the_last_period_report_once() {
    let runner = MaintenanceRunner::new(Gate::build_test().unwrap());
    let gate = runner.gate();
    gate.clock().advance(Duration::hours(25));

    assert_eq!(runner.run_once().unwrap().reports_appended, 1);
    assert_eq!(runner.run_once().unwrap().reports_appended, 0);
    assert_eq!(gate.store().report_count(gate.agent()).unwrap(), 1);
}

#[test]
fn pass_prunes_events_past_retention() {
    let runner = MaintenanceRunner::new(Gate::build_test().unwrap());
    let gate = runner.gate();
    gate.evaluate(&ctx(), "water_damage", 0.9).unwrap();
    let before = gate.store().event_count().unwrap();
    assert!(before > 0);

    let retention = gate.config().maintenance.event_retention_days;
    gate.clock().advance(Duration::days(retention + 1));
    let report = runner.run_once().unwrap();

    assert_eq!(report.events_pruned as i64, before);
    assert_eq!(gate.store().events_of_type("events_pruned").unwrap().len(), 1);
}

#[test]
fn spawned_runner_stops_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("maint.db");
    let gate = Gate::open(
        path.to_str().unwrap(),
        GateConfig::default_test(),
        GateClock::system(),
    )
    .unwrap();

    let handle = MaintenanceRunner::new(gate.worker().unwrap())
        .spawn(std::time::Duration::from_millis(10));
    std::thread::sleep(std::time::Duration::from_millis(50));
    handle.stop().unwrap();

    // The first pass always writes the previous day's report.
    assert_eq!(gate.store().report_count(gate.agent()).unwrap(), 1);
}

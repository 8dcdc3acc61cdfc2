//! Effectiveness reporter — append-only governance reports.

use chrono::{Duration, TimeZone, Utc};
use gatekeeper_core::{
    clock::GateClock,
    config::GateConfig,
    error::GateError,
    gate::Gate,
    reporter::ReportPeriod,
    workload::{default_profiles, drive, WorkloadGenerator},
};

fn day_one() -> ReportPeriod {
    ReportPeriod::new(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
    )
    .unwrap()
}

fn gate_with_traffic(n: u64) -> Gate {
    let gate = Gate::build_test().unwrap();
    let mut generator =
        WorkloadGenerator::new(11, default_profiles(), gate.config().outcome.class_labels.clone());
    // 240 s per case spreads 300 cases over both halves of the first day.
    drive(&gate, &mut generator, n, Duration::seconds(240)).unwrap();
    gate
}

#[test]
fn report_summarises_the_window() {
    let gate = gate_with_traffic(300);
    let agent = gate.agent().to_string();
    let report = gate.generate_report(&agent, &day_one()).unwrap();

    assert_eq!(report.metrics.decisions_issued, 300);
    assert_eq!(report.metrics.outcomes_validated, 300);
    assert_eq!(report.metrics.strata_observed, 4);
    assert_eq!(report.metrics.arm_outcomes.values().sum::<usize>(), 300);
    assert!(report.accuracy_delta.is_some());
    assert!(report.projection_drift > 0.0, "300 updates must move the parameters");
    assert_eq!(report.metrics.start_version, Some(0));
    assert!(!report.recommendations.is_empty());

    let read_back = gate.get_effectiveness_report(&agent, &day_one()).unwrap();
    assert_eq!(read_back.report_id, report.report_id);
    assert_eq!(read_back.period, report.period);
    assert_eq!(read_back.metrics.arm_outcomes, report.metrics.arm_outcomes);
    assert_eq!(read_back.recommendations, report.recommendations);
    assert_eq!(gate.store().events_of_type("report_appended").unwrap().len(), 1);
}

#[test]
fn regenerating_appends_and_latest_wins() {
    let gate = gate_with_traffic(50);
    let agent = gate.agent().to_string();

    let first = gate.generate_report(&agent, &day_one()).unwrap();
    let second = gate.generate_report(&agent, &day_one()).unwrap();
    assert!(second.report_id > first.report_id);

    assert_eq!(gate.store().report_count(&agent).unwrap(), 2);
    let latest = gate.get_effectiveness_report(&agent, &day_one()).unwrap();
    assert_eq!(latest.report_id, second.report_id);
}

#[test]
fn reports_cannot_be_edited_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reports.db");
    let path = path.to_str().unwrap();
    let clock = GateClock::manual(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    let gate = Gate::open(path, GateConfig::default_test(), clock).unwrap();
    let mut generator =
        WorkloadGenerator::new(11, default_profiles(), gate.config().outcome.class_labels.clone());
    drive(&gate, &mut generator, 20, Duration::seconds(240)).unwrap();

    let agent = gate.agent().to_string();
    let report = gate.generate_report(&agent, &day_one()).unwrap();

    let raw = rusqlite::Connection::open(path).unwrap();
    let edit = raw.execute(
        "UPDATE effectiveness_report SET recommendations = '[\"all good\"]' WHERE report_id = ?1",
        [report.report_id],
    );
    assert!(edit.is_err(), "update must be rejected by the trigger");
    let delete = raw.execute(
        "DELETE FROM effectiveness_report WHERE report_id = ?1",
        [report.report_id],
    );
    assert!(delete.is_err(), "delete must be rejected by the trigger");

    let read_back = gate.get_effectiveness_report(&agent, &day_one()).unwrap();
    assert_eq!(read_back.recommendations, report.recommendations);
    assert_eq!(gate.store().report_count(&agent).unwrap(), 1);
}

#[test]
fn empty_window_reports_no_outcomes() {
    let gate = Gate::build_test().unwrap();
    let agent = gate.agent().to_string();
    let report = gate.generate_report(&agent, &day_one()).unwrap();

    assert_eq!(report.metrics.outcomes_validated, 0);
    assert_eq!(report.accuracy_delta, None);
    assert_eq!(report.projection_drift, 0.0);
    assert!(report.recommendations[0].starts_with("No validated outcomes"));
}

#[test]
fn missing_report_is_not_found() {
    let gate = Gate::build_test().unwrap();
    let err = gate.get_effectiveness_report("nobody", &day_one()).unwrap_err();
    assert!(matches!(err, GateError::NotFound { .. }), "got {err:?}");
}

#[test]
fn inverted_period_is_rejected() {
    let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    assert!(matches!(ReportPeriod::new(t, t), Err(GateError::Validation(_))));

    let last = ReportPeriod::last_complete(t + Duration::hours(30), 24).unwrap();
    assert_eq!(last, day_one());
}

#[test]
fn ledger_figures_cover_the_gate_and_drift_covers_the_agent() {
    let gate = gate_with_traffic(40);
    let report = gate.generate_report("shadow-agent", &day_one()).unwrap();

    assert_eq!(report.metrics.outcomes_validated, 40);
    assert_eq!(report.metrics.start_version, None);
    assert_eq!(report.metrics.context_updates, 0);
    assert_eq!(report.projection_drift, 0.0);
}

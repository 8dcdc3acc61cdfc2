//! Safety statistics — Wilson bound golden values and counter invariants.

use chrono::{TimeZone, Utc};
use gatekeeper_core::{
    clock::GateClock,
    error::GateError,
    safety::{wilson_upper_bound, SafetyCounts, SafetyTracker},
    store::GateStore,
};
use proptest::prelude::*;

fn build_store() -> GateStore {
    let store = GateStore::in_memory().expect("in-memory store");
    store.migrate().expect("migration");
    store
}

fn clock() -> GateClock {
    GateClock::manual(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap())
}

fn assert_close(actual: f64, expected: f64, tol: f64) {
    assert!(
        (actual - expected).abs() < tol,
        "expected {expected} ± {tol}, got {actual}"
    );
}

#[test]
fn wilson_golden_values_at_95_percent() {
    assert_close(wilson_upper_bound(0, 1000, 0.95).unwrap(), 0.003_827, 1e-5);
    assert_close(wilson_upper_bound(5, 1000, 0.95).unwrap(), 0.011_651, 1e-5);
    assert_close(wilson_upper_bound(0, 20, 0.95).unwrap(), 0.161_124, 1e-5);
}

#[test]
fn twenty_clean_outcomes_are_not_enough() {
    let store = build_store();
    let clock = clock();
    let tracker = SafetyTracker::new(&store, &clock);

    for _ in 0..20 {
        tracker.record_automated_decision("s").unwrap();
    }
    let status = tracker.status("s", 0.05, 0.95).unwrap();
    assert_eq!(status.fnr, 0.0);
    assert!(status.upper_bound > 0.05, "ub={}", status.upper_bound);
    assert!(!status.is_safe, "0/20 must not be declared safe");
}

#[test]
fn seventy_three_clean_outcomes_cross_the_threshold() {
    let store = build_store();
    let clock = clock();
    let tracker = SafetyTracker::new(&store, &clock);

    for _ in 0..72 {
        tracker.record_automated_decision("s").unwrap();
    }
    assert!(!tracker.is_safe("s", 0.05, 0.95).unwrap(), "72 samples is just short");
    tracker.record_automated_decision("s").unwrap();
    assert!(tracker.is_safe("s", 0.05, 0.95).unwrap(), "73 clean samples should be safe");
}

#[test]
fn unseen_stratum_is_never_safe() {
    let store = build_store();
    let clock = clock();
    let tracker = SafetyTracker::new(&store, &clock);

    let status = tracker.status("never_seen", 0.99, 0.5).unwrap();
    assert_eq!(status.total_automated, 0);
    assert_eq!(status.upper_bound, 1.0);
    assert!(!status.is_safe);
}

#[test]
fn false_negative_without_automation_is_integrity_error() {
    let store = build_store();
    let clock = clock();
    let tracker = SafetyTracker::new(&store, &clock);

    let err = tracker.record_false_negative("s").unwrap_err();
    assert!(matches!(err, GateError::Integrity { .. }), "got {err:?}");

    // Not clamped: counters untouched, stratum quarantined, event logged.
    let row = store.get_safety_row("s").unwrap().expect("quarantine creates the row");
    assert_eq!((row.total_automated, row.false_negatives), (0, 0));
    assert!(row.quarantined);
    assert_eq!(store.events_of_type("integrity_violation").unwrap().len(), 1);

    // Quarantine overrides otherwise safe counters.
    for _ in 0..500 {
        tracker.record_automated_decision("s").unwrap();
    }
    assert!(!tracker.is_safe("s", 0.05, 0.95).unwrap());

    assert!(tracker.reconcile("s").unwrap());
    assert!(tracker.is_safe("s", 0.05, 0.95).unwrap());
    assert!(!tracker.reconcile("s").unwrap(), "reconcile twice is a no-op");
}

#[test]
fn reset_zeroes_counters_and_logs() {
    let store = build_store();
    let clock = clock();
    let tracker = SafetyTracker::new(&store, &clock);

    for _ in 0..10 {
        tracker.record_automated_decision("s").unwrap();
    }
    tracker.record_false_negative("s").unwrap();
    assert!(tracker.reset("s").unwrap());

    assert_eq!(tracker.counts("s").unwrap(), SafetyCounts::default());
    assert_eq!(store.events_of_type("stratum_reset").unwrap().len(), 1);
    assert!(!tracker.reset("unknown").unwrap());
}

#[derive(Debug, Clone)]
enum Op {
    Automated,
    FalseNegative,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![3 => Just(Op::Automated), 1 => Just(Op::FalseNegative)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Any interleaving keeps false_negatives <= total_automated, and a
    /// rejected false negative changes nothing but the quarantine flag.
    #[test]
    fn false_negatives_never_exceed_total(ops in prop::collection::vec(op(), 1..60)) {
        let store = build_store();
        let clock = clock();
        let tracker = SafetyTracker::new(&store, &clock);
        let (mut total, mut fns) = (0i64, 0i64);

        for op in ops {
            match op {
                Op::Automated => {
                    tracker.record_automated_decision("p").unwrap();
                    total += 1;
                }
                Op::FalseNegative => match tracker.record_false_negative("p") {
                    Ok(()) => fns += 1,
                    Err(GateError::Integrity { .. }) => prop_assert_eq!(fns, total),
                    Err(e) => panic!("unexpected error: {e}"),
                },
            }
            let c = tracker.counts("p").unwrap();
            prop_assert_eq!((c.total_automated, c.false_negatives), (total, fns));
            prop_assert!(c.false_negatives <= c.total_automated);
        }
    }
}

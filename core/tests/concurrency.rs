//! Several workers, one database file.
//!
//! Each worker owns its own connection. Counters must still add up exactly:
//! one ledger row per decision, one count per validated decision, and
//! false_negatives <= total_automated for every stratum.

use chrono::Duration;
use gatekeeper_core::{
    clock::GateClock,
    config::GateConfig,
    gate::{Gate, OutcomeSubmission},
    stratum::StratumContext,
    workload::{default_profiles, drive, WorkloadGenerator},
};
use std::sync::{Arc, Barrier};
use std::thread;

const WORKERS: u64 = 4;
const PER_WORKER: u64 = 120;

fn open_gate(dir: &tempfile::TempDir) -> Gate {
    let path = dir.path().join("shared.db");
    Gate::open(
        path.to_str().unwrap(),
        GateConfig::default_test(),
        GateClock::system(),
    )
    .unwrap()
}

#[test]
fn concurrent_workers_keep_counters_consistent() {
    let dir = tempfile::tempdir().unwrap();
    let gate = open_gate(&dir);

    let handles: Vec<_> = (0..WORKERS)
        .map(|lane| {
            let worker = gate.worker().unwrap();
            let labels = worker.config().outcome.class_labels.clone();
            thread::spawn(move || {
                let mut generator =
                    WorkloadGenerator::for_lane(77, lane, default_profiles(), labels);
                drive(&worker, &mut generator, PER_WORKER, Duration::zero()).unwrap()
            })
        })
        .collect();

    let mut automated = 0;
    for h in handles {
        let summary = h.join().expect("worker panicked");
        assert_eq!(summary.decisions, PER_WORKER);
        automated += summary.automated;
    }

    let total = (WORKERS * PER_WORKER) as i64;
    assert_eq!(gate.store().decision_count().unwrap(), total);
    assert!(gate.ledger().pending_downstream(1_000).unwrap().is_empty());

    let rows = gate.store().all_safety_rows().unwrap();
    let counted: i64 = rows.iter().map(|r| r.total_automated).sum();
    assert_eq!(counted, total, "every validated decision counted exactly once");
    for r in &rows {
        assert!(
            r.false_negatives <= r.total_automated,
            "stratum {} has fn={} > total={}",
            r.stratum,
            r.false_negatives,
            r.total_automated
        );
        assert!(!r.quarantined);
    }

    // Context updates are serialised per agent: none lost.
    assert_eq!(gate.current_model().unwrap().update_count(), total as u64);
    assert!(automated <= WORKERS * PER_WORKER);
}

#[test]
fn racing_resubmissions_count_once() {
    let dir = tempfile::tempdir().unwrap();
    let gate = open_gate(&dir);
    let ctx = StratumContext::new("residential", Some(1975), "hull", "structural_crack");
    let resp = gate.evaluate(&ctx, "structural_crack", 0.9).unwrap();

    let barrier = Arc::new(Barrier::new(WORKERS as usize));
    let handles: Vec<_> = (0..WORKERS)
        .map(|i| {
            let worker = gate.worker().unwrap();
            let barrier = Arc::clone(&barrier);
            let sub = OutcomeSubmission {
                decision_id: resp.decision_id.clone(),
                stratum_context: ctx.clone(),
                reward: 0.3,
                is_false_negative: false,
                true_class: "structural_crack".into(),
                predicted_class: "structural_crack".into(),
                validator_id: format!("validator-{i}"),
            };
            thread::spawn(move || {
                barrier.wait();
                worker.submit_outcome(&sub).unwrap().first_validation
            })
        })
        .collect();

    let firsts = handles
        .into_iter()
        .map(|h| h.join().expect("worker panicked"))
        .filter(|first| *first)
        .count();
    assert_eq!(firsts, 1, "exactly one submission claims the aggregation");

    assert_eq!(gate.store().decision_count_for(&resp.decision_id).unwrap(), 1);
    let status = gate.get_safety_status(&resp.stratum).unwrap();
    assert_eq!(status.total_automated, 1);
}

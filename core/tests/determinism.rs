//! Same seed, same workload, same gate ⇒ identical ledger, counters and
//! model parameters. Any divergence means something unseeded crept into
//! the decision path.

use chrono::Duration;
use gatekeeper_core::{
    gate::Gate,
    stratum::StratumContext,
    workload::{default_profiles, drive, StratumProfile, WorkloadGenerator, WorkloadSummary},
};

const CASES: u64 = 400;

fn run(seed: u64) -> (Gate, WorkloadSummary) {
    let gate = Gate::build_test().expect("test gate");
    let mut generator =
        WorkloadGenerator::new(seed, default_profiles(), gate.config().outcome.class_labels.clone());
    let summary = drive(&gate, &mut generator, CASES, Duration::seconds(30)).expect("drive");
    (gate, summary)
}

#[test]
fn same_seed_produces_identical_ledgers() {
    const SEED: u64 = 0xDEAD_BEEF_CAFE_1234;
    let (a, summary_a) = run(SEED);
    let (b, summary_b) = run(SEED);

    assert_eq!(summary_a, summary_b);

    let ledger_a = a.ledger().validated_between(i64::MIN, i64::MAX).unwrap();
    let ledger_b = b.ledger().validated_between(i64::MIN, i64::MAX).unwrap();
    assert_eq!(ledger_a.len(), CASES as usize);
    for (i, (x, y)) in ledger_a.iter().zip(&ledger_b).enumerate() {
        assert_eq!(x, y, "ledger diverged at row {i}");
    }

    assert_eq!(
        a.store().all_safety_rows().unwrap(),
        b.store().all_safety_rows().unwrap()
    );
    assert_eq!(
        a.current_model().unwrap().parameter_vector(),
        b.current_model().unwrap().parameter_vector()
    );
}

#[test]
fn different_seeds_produce_different_ledgers() {
    let (a, _) = run(42);
    let (b, _) = run(99);

    let ledger_a = a.ledger().validated_between(i64::MIN, i64::MAX).unwrap();
    let ledger_b = b.ledger().validated_between(i64::MIN, i64::MAX).unwrap();
    let any_different = ledger_a
        .iter()
        .zip(&ledger_b)
        .any(|(x, y)| x.stratum != y.stratum || x.correct != y.correct);
    assert!(any_different, "different seeds produced identical ledgers — seed is not being used");
}

#[test]
fn error_free_stratum_earns_automation() {
    let gate = Gate::build_test().expect("test gate");
    let profile = StratumProfile {
        context: StratumContext::new("residential", Some(1995), "london", "water_damage"),
        error_rate: 0.0,
    };
    let mut generator =
        WorkloadGenerator::new(7, vec![profile], gate.config().outcome.class_labels.clone());
    let summary = drive(&gate, &mut generator, 100, Duration::seconds(30)).expect("drive");

    // 73 clean shadow outcomes verify the stratum; the rest may automate.
    assert_eq!(summary.verified_strata, 1, "{summary:?}");
    assert!(summary.automated >= 1, "{summary:?}");
    assert_eq!(summary.automated_false_negatives, 0);
}

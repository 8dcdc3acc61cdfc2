//! Safety statistics tracker.
//!
//! Per stratum the gate keeps `(total_automated, false_negatives)` and asks
//! one question: is the Wilson score upper bound on the true false-negative
//! rate at or below the threshold? A raw FNR of zero over a handful of
//! samples is not evidence of safety; the upper bound only falls under the
//! threshold once enough outcomes exist. Unsafe until proven safe:
//! a stratum with no automated decisions is never safe.
//!
//! Invariant: false_negatives <= total_automated, enforced by the guarded
//! increment in storage. A false negative that would break it is an
//! IntegrityError and quarantines the stratum. It is never clamped.

use crate::{
    clock::GateClock,
    error::{GateError, GateResult},
    event::GateEvent,
    store::GateStore,
    types::{StratumKey, StratumState},
};
use serde::{Deserialize, Serialize};

const COMPONENT: &str = "safety";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SafetyCounts {
    pub total_automated: i64,
    pub false_negatives: i64,
}

impl SafetyCounts {
    /// Sample FNR; 0 when nothing has been automated.
    pub fn fnr(&self) -> f64 {
        if self.total_automated == 0 {
            0.0
        } else {
            self.false_negatives as f64 / self.total_automated as f64
        }
    }

    pub fn upper_bound(&self, confidence: f64) -> GateResult<f64> {
        wilson_upper_bound(
            self.false_negatives.max(0) as u64,
            self.total_automated.max(0) as u64,
            confidence,
        )
    }
}

/// Dashboard view of a stratum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyStatus {
    pub stratum:         StratumKey,
    pub total_automated: i64,
    pub false_negatives: i64,
    pub fnr:             f64,
    pub upper_bound:     f64,
    pub is_safe:         bool,
    pub state:           StratumState,
    pub quarantined:     bool,
}

// ── Statistics ─────────────────────────────────────────────────────

/// Standard normal quantile Φ⁻¹(p), Acklam's rational approximation
/// (relative error below 1.2e-9 over the open interval).
pub fn normal_quantile(p: f64) -> f64 {
    const A: [f64; 6] = [
        -3.969_683_028_665_376e1,
        2.209_460_984_245_205e2,
        -2.759_285_104_469_687e2,
        1.383_577_518_672_690e2,
        -3.066_479_806_614_716e1,
        2.506_628_277_459_239,
    ];
    const B: [f64; 5] = [
        -5.447_609_879_822_406e1,
        1.615_858_368_580_409e2,
        -1.556_989_798_598_866e2,
        6.680_131_188_771_972e1,
        -1.328_068_155_288_572e1,
    ];
    const C: [f64; 6] = [
        -7.784_894_002_430_293e-3,
        -3.223_964_580_411_365e-1,
        -2.400_758_277_161_838,
        -2.549_732_539_343_734,
        4.374_664_141_464_968,
        2.938_163_982_698_783,
    ];
    const D: [f64; 4] = [
        7.784_695_709_041_462e-3,
        3.224_671_290_700_398e-1,
        2.445_134_137_142_996,
        3.754_408_661_907_416,
    ];
    const P_LOW: f64 = 0.024_25;

    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }

    let tail = |q: f64| {
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    };

    if p < P_LOW {
        tail((-2.0 * p.ln()).sqrt())
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        -tail((-2.0 * (1.0 - p).ln()).sqrt())
    }
}

/// z for a confidence level: Φ⁻¹(1 − (1 − confidence) / 2).
pub fn z_for_confidence(confidence: f64) -> GateResult<f64> {
    if !(confidence.is_finite() && confidence > 0.0 && confidence < 1.0) {
        return Err(GateError::Constraint(format!(
            "confidence {confidence} must be in (0, 1)"
        )));
    }
    Ok(normal_quantile(1.0 - (1.0 - confidence) / 2.0))
}

/// Wilson score upper bound on a binomial proportion.
///
/// Stays well-behaved at `false_negatives = 0`, where the normal
/// approximation collapses to zero. Returns 1.0 when `total` is 0.
pub fn wilson_upper_bound(false_negatives: u64, total: u64, confidence: f64) -> GateResult<f64> {
    let z = z_for_confidence(confidence)?;
    if total == 0 {
        return Ok(1.0);
    }
    let n = total as f64;
    let k = false_negatives.min(total) as f64;
    let p_hat = k / n;
    let z2 = z * z;

    let denom = 1.0 + z2 / n;
    let center = (p_hat + z2 / (2.0 * n)) / denom;
    let radius = z * ((p_hat * (1.0 - p_hat) / n) + z2 / (4.0 * n * n)).sqrt() / denom;
    Ok((center + radius).clamp(0.0, 1.0))
}

/// The gate's verdict rule on raw counts.
pub fn is_safe_counts(
    counts: SafetyCounts,
    threshold: f64,
    confidence: f64,
) -> GateResult<bool> {
    if counts.total_automated <= 0 {
        return Ok(false);
    }
    Ok(counts.upper_bound(confidence)? <= threshold)
}

// ── Tracker ────────────────────────────────────────────────────────

pub struct SafetyTracker<'a> {
    store: &'a GateStore,
    clock: &'a GateClock,
}

impl<'a> SafetyTracker<'a> {
    pub fn new(store: &'a GateStore, clock: &'a GateClock) -> Self {
        Self { store, clock }
    }

    /// total_automated += 1 (atomic in storage).
    pub fn record_automated_decision(&self, stratum: &str) -> GateResult<()> {
        self.store
            .increment_total_automated(stratum, self.clock.now_millis())
    }

    /// false_negatives += 1 (atomic, guarded). Fails with Integrity and
    /// quarantines the stratum if it would exceed total_automated.
    pub fn record_false_negative(&self, stratum: &str) -> GateResult<()> {
        match self.try_record_false_negative(stratum) {
            Err(GateError::Integrity { stratum, detail }) => {
                self.quarantine(&stratum, &detail)?;
                Err(GateError::Integrity { stratum, detail })
            }
            other => other,
        }
    }

    /// Guarded increment without the quarantine side effect. For callers
    /// inside a transaction that will roll back on error and quarantine
    /// once it has.
    pub fn try_record_false_negative(&self, stratum: &str) -> GateResult<()> {
        if self
            .store
            .increment_false_negatives(stratum, self.clock.now_millis())?
        {
            return Ok(());
        }
        let counts = self.counts(stratum)?;
        Err(GateError::Integrity {
            stratum: stratum.to_string(),
            detail: format!(
                "false negative reported with total_automated={} false_negatives={}",
                counts.total_automated, counts.false_negatives
            ),
        })
    }

    /// Force the stratum to unverified until reconciled. Idempotent.
    pub fn quarantine(&self, stratum: &str, detail: &str) -> GateResult<()> {
        let now = self.clock.now_millis();
        log::error!("stratum={stratum} integrity violation: {detail}");
        self.store.quarantine_stratum(stratum, now)?;
        self.store.record_event(
            now,
            COMPONENT,
            &GateEvent::IntegrityViolation {
                stratum: stratum.to_string(),
                detail: detail.to_string(),
            },
        )
    }

    pub fn counts(&self, stratum: &str) -> GateResult<SafetyCounts> {
        Ok(self
            .store
            .get_safety_row(stratum)?
            .map(|r| SafetyCounts {
                total_automated: r.total_automated,
                false_negatives: r.false_negatives,
            })
            .unwrap_or_default())
    }

    /// True iff the stratum has data, is not quarantined, and the Wilson
    /// upper bound at `confidence` is at or below `threshold`.
    pub fn is_safe(&self, stratum: &str, threshold: f64, confidence: f64) -> GateResult<bool> {
        Ok(self.status(stratum, threshold, confidence)?.is_safe)
    }

    pub fn status(
        &self,
        stratum: &str,
        threshold: f64,
        confidence: f64,
    ) -> GateResult<SafetyStatus> {
        let row = self.store.get_safety_row(stratum)?;
        let (counts, state, quarantined) = match row {
            Some(r) => (
                SafetyCounts {
                    total_automated: r.total_automated,
                    false_negatives: r.false_negatives,
                },
                r.state,
                r.quarantined,
            ),
            None => (SafetyCounts::default(), StratumState::Unverified, false),
        };
        let upper_bound = counts.upper_bound(confidence)?;
        let is_safe = !quarantined && is_safe_counts(counts, threshold, confidence)?;
        Ok(SafetyStatus {
            stratum: stratum.to_string(),
            total_automated: counts.total_automated,
            false_negatives: counts.false_negatives,
            fnr: counts.fnr(),
            upper_bound,
            is_safe,
            state,
            quarantined,
        })
    }

    /// Explicit cleanup: zero counters, drop arm statistics, unverify.
    pub fn reset(&self, stratum: &str) -> GateResult<bool> {
        let now = self.clock.now_millis();
        let existed = self.store.reset_stratum_counters(stratum, now)?;
        if existed {
            log::info!("stratum={stratum} counters reset");
            self.store.record_event(
                now,
                COMPONENT,
                &GateEvent::StratumReset { stratum: stratum.to_string() },
            )?;
        }
        Ok(existed)
    }

    /// Manual reconciliation after an integrity failure.
    pub fn reconcile(&self, stratum: &str) -> GateResult<bool> {
        let now = self.clock.now_millis();
        let cleared = self.store.clear_quarantine(stratum, now)?;
        if cleared {
            log::info!("stratum={stratum} reconciled, quarantine cleared");
            self.store.record_event(
                now,
                COMPONENT,
                &GateEvent::StratumReconciled { stratum: stratum.to_string() },
            )?;
        }
        Ok(cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn z_at_95_percent_is_1_96() {
        let z = z_for_confidence(0.95).unwrap();
        assert!((z - 1.959_964).abs() < 1e-5, "z={z}");
    }

    #[test]
    fn normal_quantile_is_symmetric() {
        for p in [0.001, 0.01, 0.1, 0.3] {
            let lo = normal_quantile(p);
            let hi = normal_quantile(1.0 - p);
            assert!((lo + hi).abs() < 1e-8, "p={p} lo={lo} hi={hi}");
        }
        assert_eq!(normal_quantile(0.5), 0.0);
    }

    #[test]
    fn empty_stratum_bound_is_one() {
        assert_eq!(wilson_upper_bound(0, 0, 0.95).unwrap(), 1.0);
    }

    #[test]
    fn invalid_confidence_is_constraint_error() {
        assert!(matches!(
            wilson_upper_bound(0, 10, 1.0),
            Err(GateError::Constraint(_))
        ));
    }

    #[test]
    fn zero_total_is_never_safe() {
        let counts = SafetyCounts::default();
        assert!(!is_safe_counts(counts, 0.99, 0.5).unwrap());
        assert_eq!(counts.fnr(), 0.0);
    }

    proptest! {
        #[test]
        fn bound_is_at_least_sample_rate(total in 1u64..5_000, k in 0u64..5_000) {
            let k = k.min(total);
            let ub = wilson_upper_bound(k, total, 0.95).unwrap();
            prop_assert!(ub + 1e-12 >= k as f64 / total as f64);
            prop_assert!(ub <= 1.0);
        }

        #[test]
        fn more_clean_samples_never_raise_the_bound(n1 in 1u64..2_000, extra in 1u64..2_000) {
            let a = wilson_upper_bound(0, n1, 0.95).unwrap();
            let b = wilson_upper_bound(0, n1 + extra, 0.95).unwrap();
            prop_assert!(b <= a + 1e-12);
        }
    }
}

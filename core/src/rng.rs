//! Deterministic random number generation for the workload harness.
//!
//! RULE: the synthetic workload never calls a platform RNG.
//! All randomness flows through WorkloadRng streams derived from the single
//! seed given to the runner.
//!
//! Each concern gets its own stream, seeded from (seed XOR slot index), so
//! adding a stream never shifts the draws of an existing one.
//!
//! The gate itself is not random: arm selection is deterministic and
//! decision ids are UUID v4 only when the caller does not supply one.

use rand::{RngCore, SeedableRng};
use rand_pcg::Pcg64Mcg;

/// A named, deterministic RNG for one workload concern.
pub struct WorkloadRng {
    pub name: &'static str,
    inner: Pcg64Mcg,
}

impl WorkloadRng {
    /// The slot index must never change once assigned.
    pub fn new(seed: u64, slot: StreamSlot) -> Self {
        let derived_seed = seed ^ (slot as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15);
        Self {
            name: slot.name(),
            inner: Pcg64Mcg::seed_from_u64(derived_seed),
        }
    }

    /// Uniform in [0.0, 1.0).
    pub fn next_f64(&mut self) -> f64 {
        let bits = self.inner.next_u64();
        (bits >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    /// Uniform in [0, n). `n` must be positive.
    pub fn next_below(&mut self, n: u64) -> u64 {
        assert!(n > 0, "n must be > 0");
        self.inner.next_u64() % n
    }

    /// Bernoulli trial with probability p.
    pub fn chance(&mut self, p: f64) -> bool {
        self.next_f64() < p
    }

    /// Uniform in [lo, hi).
    pub fn uniform(&mut self, lo: f64, hi: f64) -> f64 {
        lo + (hi - lo) * self.next_f64()
    }
}

/// Stable stream assignments.
/// NEVER reorder or remove entries. Only append.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum StreamSlot {
    Strata = 0,
    Labels = 1,
    Confidence = 2,
    Errors = 3,
}

impl StreamSlot {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Strata => "strata",
            Self::Labels => "labels",
            Self::Confidence => "confidence",
            Self::Errors => "errors",
        }
    }
}

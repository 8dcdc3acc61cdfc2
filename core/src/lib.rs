//! Safety-gated automation core.
//!
//! Decides, per assessment, whether an automated damage-classification
//! output may be acted on (automate) or must go to human review (defer).
//! Automation in a stratum is allowed only once the Wilson upper bound on
//! its false-negative rate is under the threshold, and is revoked by the
//! very next decision after it rises above it.

pub mod clock;
pub mod config;
pub mod context_model;
pub mod error;
pub mod event;
pub mod gate;
pub mod ledger;
pub mod maintenance;
pub mod policy;
pub mod reporter;
pub mod rng;
pub mod safety;
pub mod store;
pub mod stratum;
pub mod types;
pub mod workload;

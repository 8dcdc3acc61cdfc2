//! Shared primitive types used across the gate.

use serde::{Deserialize, Serialize};

/// Cohort key produced by the stratum registry.
pub type StratumKey = String;

/// Unique identifier of one decision (UUID v4 text when generated here).
pub type DecisionId = String;

/// Name of a policy agent owning a context model.
pub type AgentName = String;

pub type ArmId = String;

/// Milliseconds since the Unix epoch. All timestamps are stored this way.
pub type EpochMillis = i64;

/// What the gate tells the caller to do with a prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Automate,
    /// Send to human review. A valid outcome, not an error.
    Defer,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Automate => "automate",
            Action::Defer => "defer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "automate" => Some(Action::Automate),
            "defer" => Some(Action::Defer),
            _ => None,
        }
    }
}

/// Policy meta-state of a stratum. Every stratum starts unverified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StratumState {
    Unverified,
    Verified,
}

impl StratumState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StratumState::Unverified => "unverified",
            StratumState::Verified => "verified",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unverified" => Some(StratumState::Unverified),
            "verified" => Some(StratumState::Verified),
            _ => None,
        }
    }
}

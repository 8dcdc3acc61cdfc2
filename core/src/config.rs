use crate::{
    error::{GateError, GateResult},
    types::Action,
};
use serde::{Deserialize, Serialize};

// ── Safety gate ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Hard ceiling on the false-negative rate's upper confidence bound.
    pub threshold: f64,
    /// Confidence level of the Wilson interval (0.95 ⇒ z ≈ 1.96).
    pub confidence: f64,
    /// Busy timeout for the safety check. Exceeding it resolves as defer.
    pub safety_check_timeout_ms: u64,
    /// When true every validated assessment counts as an automation trial,
    /// including deferred ones (shadow evaluation). When false only decisions
    /// that were actually automated feed the counters.
    #[serde(default = "default_true")]
    pub count_deferred_outcomes: bool,
}

// ── Bandit policy ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArmConfig {
    pub arm_id: String,
    pub action: Action,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub experiment_id: String,
    pub arms: Vec<ArmConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Predictions below this model confidence are always deferred.
    pub min_confidence: f64,
    /// Context-model expected accuracy below this is always deferred.
    pub min_expected_accuracy: f64,
    /// UCB exploration coefficient.
    pub exploration_c: f64,
    pub experiment: ExperimentConfig,
}

// ── Outcome domain ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeConfig {
    pub reward_min: f64,
    pub reward_max: f64,
    /// Closed set of class labels accepted for predicted/true class.
    pub class_labels: Vec<String>,
}

// ── Context model ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextModelConfig {
    pub input_dim: usize,
    pub feature_dim: usize,
    pub learning_rate: f64,
    pub memory_capacity: usize,
    /// Parameter history snapshot every N updates.
    pub snapshot_interval: u64,
}

// ── Reporting / maintenance ────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    pub period_hours: i64,
    /// Projection drift above this produces a review recommendation.
    pub drift_alert: f64,
    /// Accuracy drop (absolute) that produces a recommendation.
    pub accuracy_drop_alert: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    pub interval_secs: u64,
    pub event_retention_days: i64,
    pub replay_batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    pub agent_name: String,
    pub safety: SafetyConfig,
    pub policy: PolicyConfig,
    pub outcome: OutcomeConfig,
    pub context_model: ContextModelConfig,
    pub report: ReportConfig,
    pub maintenance: MaintenanceConfig,
}

fn default_true() -> bool {
    true
}

impl GateConfig {
    /// Load from the data/ directory.
    /// In tests, use GateConfig::default_test().
    pub fn load(data_dir: &str) -> anyhow::Result<Self> {
        let path = format!("{data_dir}/gate/gate_config.json");
        let content = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let config: GateConfig = serde_json::from_str(&content)?;
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid config {path}: {e}"))?;
        Ok(config)
    }

    /// Reject configurations the gate cannot run safely with.
    pub fn validate(&self) -> GateResult<()> {
        let s = &self.safety;
        if !(s.threshold > 0.0 && s.threshold < 1.0) {
            return Err(GateError::Validation(format!(
                "safety.threshold must be in (0, 1), got {}",
                s.threshold
            )));
        }
        if !(s.confidence > 0.0 && s.confidence < 1.0) {
            return Err(GateError::Validation(format!(
                "safety.confidence must be in (0, 1), got {}",
                s.confidence
            )));
        }

        let arms = &self.policy.experiment.arms;
        if !arms.iter().any(|a| a.action == Action::Defer) {
            return Err(GateError::Validation(
                "experiment needs at least one defer arm".into(),
            ));
        }
        let mut ids: Vec<&str> = arms.iter().map(|a| a.arm_id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != arms.len() {
            return Err(GateError::Validation("duplicate arm_id in experiment".into()));
        }

        let o = &self.outcome;
        if !(o.reward_min.is_finite() && o.reward_max.is_finite() && o.reward_min < o.reward_max)
        {
            return Err(GateError::Validation(format!(
                "reward bounds [{}, {}] are not a valid range",
                o.reward_min, o.reward_max
            )));
        }
        if o.class_labels.is_empty() {
            return Err(GateError::Validation("class_labels must not be empty".into()));
        }

        let c = &self.context_model;
        if c.input_dim < 4 {
            return Err(GateError::Validation(format!(
                "context_model.input_dim must be >= 4, got {}",
                c.input_dim
            )));
        }
        if c.feature_dim == 0 || c.feature_dim > c.input_dim {
            return Err(GateError::Validation(format!(
                "context_model.feature_dim must be in 1..={}, got {}",
                c.input_dim, c.feature_dim
            )));
        }
        if c.memory_capacity == 0 || c.snapshot_interval == 0 {
            return Err(GateError::Validation(
                "memory_capacity and snapshot_interval must be positive".into(),
            ));
        }
        if self.report.period_hours <= 0 {
            return Err(GateError::Validation("report.period_hours must be positive".into()));
        }
        Ok(())
    }

    /// Config with hardcoded defaults for use in unit tests.
    pub fn default_test() -> Self {
        Self {
            agent_name: "damage_assessment_gate".into(),
            safety: SafetyConfig {
                threshold: 0.05,
                confidence: 0.95,
                safety_check_timeout_ms: 250,
                count_deferred_outcomes: true,
            },
            policy: PolicyConfig {
                min_confidence: 0.5,
                min_expected_accuracy: 0.0,
                exploration_c: 1.0,
                experiment: ExperimentConfig {
                    experiment_id: "automation_gate_v1".into(),
                    arms: vec![
                        ArmConfig { arm_id: "automate".into(), action: Action::Automate },
                        ArmConfig { arm_id: "human_review".into(), action: Action::Defer },
                    ],
                },
            },
            outcome: OutcomeConfig {
                reward_min: -1.0,
                reward_max: 1.0,
                class_labels: vec![
                    "no_damage".into(),
                    "cosmetic".into(),
                    "water_damage".into(),
                    "structural_crack".into(),
                    "electrical_hazard".into(),
                ],
            },
            context_model: ContextModelConfig {
                input_dim: 8,
                feature_dim: 4,
                learning_rate: 0.05,
                memory_capacity: 16,
                snapshot_interval: 1,
            },
            report: ReportConfig {
                period_hours: 24,
                drift_alert: 1.0,
                accuracy_drop_alert: 0.05,
            },
            maintenance: MaintenanceConfig {
                interval_secs: 60,
                event_retention_days: 30,
                replay_batch_size: 100,
            },
        }
    }
}

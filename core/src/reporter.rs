//! Effectiveness reporter — batch governance summaries.
//!
//! Not on the decision hot path. For one agent and one period it compares
//! the context model's parameter history at the period edges (projection
//! drift), splits the period's validated outcomes into halves (accuracy
//! delta), and appends one immutable report row. Reports are never edited;
//! a correction is a new row for the same (agent, period), and reads return
//! the most recent one.

use crate::{
    clock::{from_millis, GateClock},
    config::GateConfig,
    context_model::parameter_drift,
    error::{GateError, GateResult},
    event::GateEvent,
    store::{GateStore, ReportRow},
    types::{Action, AgentName},
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

const COMPONENT: &str = "reporter";

/// Half-open reporting window [start, end).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportPeriod {
    pub start: DateTime<Utc>,
    pub end:   DateTime<Utc>,
}

impl ReportPeriod {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> GateResult<Self> {
        if end <= start {
            return Err(GateError::Validation(format!(
                "report period end {end} is not after start {start}"
            )));
        }
        Ok(Self { start, end })
    }

    /// The most recent fully elapsed period of `hours`, aligned to the epoch.
    pub fn last_complete(now: DateTime<Utc>, hours: i64) -> GateResult<Self> {
        let len_ms = Duration::hours(hours).num_milliseconds();
        if len_ms <= 0 {
            return Err(GateError::Validation("period length must be positive".into()));
        }
        let end_ms = now.timestamp_millis().div_euclid(len_ms) * len_ms;
        Self::new(from_millis(end_ms - len_ms), from_millis(end_ms))
    }

    pub fn start_ms(&self) -> i64 {
        self.start.timestamp_millis()
    }

    pub fn end_ms(&self) -> i64 {
        self.end.timestamp_millis()
    }

    pub fn label(&self) -> String {
        format!(
            "{}..{}",
            self.start.format("%Y-%m-%dT%H:%MZ"),
            self.end.format("%Y-%m-%dT%H:%MZ")
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ReportMetrics {
    pub decisions_issued:     i64,
    pub outcomes_validated:   usize,
    pub automated_outcomes:   usize,
    pub false_negatives:      usize,
    pub window_fnr:           f64,
    pub accuracy_first_half:  Option<f64>,
    pub accuracy_second_half: Option<f64>,
    pub mean_reward:          Option<f64>,
    pub arm_outcomes:         BTreeMap<String, usize>,
    pub strata_observed:      usize,
    pub quarantined_strata:   i64,
    pub start_version:        Option<i64>,
    pub end_version:          Option<i64>,
    pub context_updates:      u64,
    pub mean_abs_surprise:    f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectivenessReport {
    pub report_id:        i64,
    pub agent:            AgentName,
    pub period:           ReportPeriod,
    pub metrics:          ReportMetrics,
    pub projection_drift: f64,
    pub accuracy_delta:   Option<f64>,
    pub recommendations:  Vec<String>,
    pub created_at:       DateTime<Utc>,
}

impl EffectivenessReport {
    fn from_row(row: ReportRow) -> GateResult<Self> {
        Ok(Self {
            report_id:        row.report_id,
            agent:            row.agent,
            period:           ReportPeriod::new(
                from_millis(row.period_start),
                from_millis(row.period_end),
            )?,
            metrics:          serde_json::from_str(&row.metrics)?,
            projection_drift: row.projection_drift,
            accuracy_delta:   row.accuracy_delta,
            recommendations:  serde_json::from_str(&row.recommendations)?,
            created_at:       from_millis(row.created_at),
        })
    }
}

pub struct EffectivenessReporter<'a> {
    store:  &'a GateStore,
    clock:  &'a GateClock,
    config: &'a GateConfig,
}

impl<'a> EffectivenessReporter<'a> {
    pub fn new(store: &'a GateStore, clock: &'a GateClock, config: &'a GateConfig) -> Self {
        Self { store, clock, config }
    }

    /// Compute and append a report for `agent` over `period`.
    ///
    /// The ledger has no agent column: decision counts, outcomes, arm counts
    /// and quarantined strata cover everything this gate's database holds.
    /// Only the parameter drift and context figures are scoped to `agent`.
    pub fn generate(&self, agent: &str, period: &ReportPeriod) -> GateResult<EffectivenessReport> {
        let (start, end) = (period.start_ms(), period.end_ms());

        // ── Ledger side ─────────────────────────────
        let outcomes = self.store.validated_outcomes_between(start, end)?;
        let mut metrics = ReportMetrics {
            decisions_issued: self.store.decisions_created_between(start, end)?,
            outcomes_validated: outcomes.len(),
            quarantined_strata: self.store.quarantined_count()?,
            ..ReportMetrics::default()
        };

        let mid = start + (end - start) / 2;
        let (mut first, mut second) = ((0usize, 0usize), (0usize, 0usize));
        let mut strata = BTreeSet::new();
        let mut reward_sum = 0.0;
        for o in &outcomes {
            strata.insert(o.stratum.as_str());
            *metrics.arm_outcomes.entry(o.arm_id.clone()).or_insert(0) += 1;
            reward_sum += o.reward;
            if o.action == Action::Automate {
                metrics.automated_outcomes += 1;
            }
            if o.safety_flag {
                metrics.false_negatives += 1;
            }
            let half = if o.validated_at < mid { &mut first } else { &mut second };
            half.1 += 1;
            if o.correct {
                half.0 += 1;
            }
        }
        metrics.strata_observed = strata.len();
        if !outcomes.is_empty() {
            metrics.window_fnr = metrics.false_negatives as f64 / outcomes.len() as f64;
            metrics.mean_reward = Some(reward_sum / outcomes.len() as f64);
        }
        let rate = |(ok, n): (usize, usize)| (n > 0).then(|| ok as f64 / n as f64);
        metrics.accuracy_first_half = rate(first);
        metrics.accuracy_second_half = rate(second);
        let accuracy_delta = match (metrics.accuracy_first_half, metrics.accuracy_second_half) {
            (Some(a), Some(b)) => Some(b - a),
            _ => None,
        };

        // ── Context model side ──────────────────────
        let start_snap = match self.store.context_snapshot_at_or_before(agent, start)? {
            Some(s) => Some(s),
            None => self.store.earliest_context_snapshot(agent)?,
        };
        let end_snap = self.store.context_snapshot_at_or_before(agent, end)?;
        let projection_drift = match (&start_snap, &end_snap) {
            (Some(a), Some(b)) => parameter_drift(&a.parameters, &b.parameters),
            _ => 0.0,
        };
        metrics.start_version = start_snap.as_ref().map(|s| s.version);
        metrics.end_version = end_snap.as_ref().map(|s| s.version);
        if let Some(model) = self
            .store
            .load_context(agent, self.config.context_model.memory_capacity)?
        {
            metrics.context_updates = model.update_count();
            metrics.mean_abs_surprise = model.memory().mean_abs_value();
        }

        let recommendations = self.recommend(&metrics, projection_drift, accuracy_delta);

        // ── Append ──────────────────────────────────
        let now = self.clock.now_millis();
        let row = ReportRow {
            report_id: 0,
            agent: agent.to_string(),
            period_start: start,
            period_end: end,
            period_label: period.label(),
            metrics: serde_json::to_string(&metrics)?,
            projection_drift,
            accuracy_delta,
            recommendations: serde_json::to_string(&recommendations)?,
            created_at: now,
        };
        let report_id = self.store.insert_report(&row)?;
        self.store.record_event(
            now,
            COMPONENT,
            &GateEvent::ReportAppended {
                agent: agent.to_string(),
                report_id,
                period_label: row.period_label.clone(),
            },
        )?;
        log::info!(
            "agent={agent} report={report_id} period={} drift={projection_drift:.4} outcomes={}",
            row.period_label,
            metrics.outcomes_validated
        );

        Ok(EffectivenessReport {
            report_id,
            agent: agent.to_string(),
            period: *period,
            metrics,
            projection_drift,
            accuracy_delta,
            recommendations,
            created_at: from_millis(now),
        })
    }

    /// Most recent report for exactly (agent, period).
    pub fn latest(&self, agent: &str, period: &ReportPeriod) -> GateResult<EffectivenessReport> {
        let row = self
            .store
            .latest_report(agent, period.start_ms(), period.end_ms())?
            .ok_or_else(|| GateError::NotFound {
                entity: "effectiveness report",
                id: format!("{agent}@{}", period.label()),
            })?;
        EffectivenessReport::from_row(row)
    }

    pub fn exists(&self, agent: &str, period: &ReportPeriod) -> GateResult<bool> {
        Ok(self
            .store
            .latest_report(agent, period.start_ms(), period.end_ms())?
            .is_some())
    }

    fn recommend(
        &self,
        m: &ReportMetrics,
        drift: f64,
        accuracy_delta: Option<f64>,
    ) -> Vec<String> {
        let r = &self.config.report;
        let mut out = Vec::new();

        if m.outcomes_validated == 0 {
            out.push("No validated outcomes in this period; accuracy cannot be assessed.".into());
        }
        if drift > r.drift_alert {
            out.push(format!(
                "Projection drift {drift:.3} exceeds {:.3}; review recent surprise history before widening automation.",
                r.drift_alert
            ));
        }
        if let Some(delta) = accuracy_delta {
            if delta < -r.accuracy_drop_alert {
                out.push(format!(
                    "Accuracy fell by {:.1} points within the period; consider raising min_confidence.",
                    -delta * 100.0
                ));
            }
        }
        if m.outcomes_validated > 0 && m.window_fnr > self.config.safety.threshold {
            out.push(format!(
                "Period false-negative rate {:.3} is above the {:.3} safety threshold; audit automated strata.",
                m.window_fnr, self.config.safety.threshold
            ));
        }
        if m.quarantined_strata > 0 {
            out.push(format!(
                "{} strata quarantined after integrity failures; reconcile before re-enabling automation.",
                m.quarantined_strata
            ));
        }
        if out.is_empty() {
            out.push("No action required.".into());
        }
        out
    }
}

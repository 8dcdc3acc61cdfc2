//! Store methods for assessments and the decision ledger.

use super::{map_reference_error, GateStore};
use crate::{
    error::{GateError, GateResult},
    ledger::{Assessment, Decision, DecisionRecord, OutcomeRecord},
    types::{Action, EpochMillis},
};
use rusqlite::{params, OptionalExtension, Row};

const DECISION_COLUMNS: &str = "decision_id, stratum, experiment_id, arm_id, action, \
     assessment_id, expected_accuracy, reward, safety_flag, predicted_class, true_class, \
     validator_id, validated_at, downstream_applied, created_at, updated_at";

fn decision_from_row(row: &Row<'_>) -> rusqlite::Result<Decision> {
    let action: String = row.get(4)?;
    Ok(Decision {
        decision_id:        row.get(0)?,
        stratum:            row.get(1)?,
        experiment_id:      row.get(2)?,
        arm_id:             row.get(3)?,
        // CHECK constraint limits the column; anything else fails closed.
        action:             Action::parse(&action).unwrap_or(Action::Defer),
        assessment_id:      row.get(5)?,
        expected_accuracy:  row.get(6)?,
        reward:             row.get(7)?,
        safety_flag:        row.get::<_, i64>(8)? != 0,
        predicted_class:    row.get(9)?,
        true_class:         row.get(10)?,
        validator_id:       row.get(11)?,
        validated_at:       row.get(12)?,
        downstream_applied: row.get::<_, i64>(13)? != 0,
        created_at:         row.get(14)?,
        updated_at:         row.get(15)?,
    })
}

/// One validated outcome as seen by the effectiveness reporter.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedOutcome {
    pub decision_id:  String,
    pub stratum:      String,
    pub arm_id:       String,
    pub action:       Action,
    pub safety_flag:  bool,
    pub correct:      bool,
    pub reward:       f64,
    pub validated_at: EpochMillis,
}

impl GateStore {
    // ── Assessment ─────────────────────────────────────────────

    pub fn insert_assessment(&self, a: &Assessment) -> GateResult<()> {
        self.conn
            .execute(
                "INSERT INTO assessment (assessment_id, stratum, predicted_class, confidence, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![a.assessment_id, a.stratum, a.predicted_class, a.confidence, a.created_at],
            )
            .map_err(|e| map_reference_error(e, "assessment"))?;
        Ok(())
    }

    pub fn get_assessment(&self, assessment_id: &str) -> GateResult<Option<Assessment>> {
        Ok(self
            .conn
            .query_row(
                "SELECT assessment_id, stratum, predicted_class, confidence, created_at
                 FROM assessment WHERE assessment_id = ?1",
                params![assessment_id],
                |row| {
                    Ok(Assessment {
                        assessment_id:   row.get(0)?,
                        stratum:         row.get(1)?,
                        predicted_class: row.get(2)?,
                        confidence:      row.get(3)?,
                        created_at:      row.get(4)?,
                    })
                },
            )
            .optional()?)
    }

    // ── Decision ledger ────────────────────────────────────────

    /// Insert a pending decision. The action is taken from the registered
    /// arm so a decision can never reference an arm that does not exist.
    pub fn insert_decision(&self, d: &DecisionRecord) -> GateResult<Decision> {
        let sql = format!(
            "INSERT INTO decision_ledger (
                decision_id, stratum, experiment_id, arm_id, action, assessment_id,
                expected_accuracy, predicted_class, created_at, updated_at
             )
             SELECT ?1, ?2, ea.experiment_id, ea.arm_id, ea.action, ?5, ?6, ?7, ?8, ?8
             FROM experiment_arm ea
             WHERE ea.experiment_id = ?3 AND ea.arm_id = ?4
             RETURNING {DECISION_COLUMNS}"
        );
        let row = self
            .conn
            .query_row(
                &sql,
                params![
                    d.decision_id,
                    d.stratum,
                    d.experiment_id,
                    d.arm_id,
                    d.assessment_id,
                    d.expected_accuracy,
                    d.predicted_class,
                    d.created_at,
                ],
                decision_from_row,
            )
            .optional()
            .map_err(|e| map_reference_error(e, "decision"))?;
        row.ok_or_else(|| {
            GateError::Validation(format!(
                "decision {}: unknown experiment arm {}/{}",
                d.decision_id, d.experiment_id, d.arm_id
            ))
        })
    }

    /// Single-statement upsert of a validated outcome. If the decision id
    /// exists, every validated field is overwritten (last write wins);
    /// otherwise a new row is created. Never read-then-write.
    pub fn upsert_outcome(&self, o: &OutcomeRecord, now: EpochMillis) -> GateResult<Decision> {
        let sql = format!(
            "INSERT INTO decision_ledger (
                decision_id, stratum, experiment_id, arm_id, action, assessment_id,
                reward, safety_flag, predicted_class, true_class, validator_id,
                validated_at, created_at, updated_at
             )
             SELECT ?1, ?2, ea.experiment_id, ea.arm_id, ea.action, ?5,
                    ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12
             FROM experiment_arm ea
             WHERE ea.experiment_id = ?3 AND ea.arm_id = ?4
             ON CONFLICT(decision_id) DO UPDATE SET
                reward          = excluded.reward,
                safety_flag     = excluded.safety_flag,
                predicted_class = excluded.predicted_class,
                true_class      = excluded.true_class,
                validator_id    = excluded.validator_id,
                validated_at    = excluded.validated_at,
                updated_at      = excluded.updated_at
             RETURNING {DECISION_COLUMNS}"
        );
        let row = self
            .conn
            .query_row(
                &sql,
                params![
                    o.decision_id,
                    o.stratum,
                    o.experiment_id,
                    o.arm_id,
                    o.assessment_id,
                    o.reward,
                    o.safety_flag as i64,
                    o.predicted_class,
                    o.true_class,
                    o.validator_id,
                    o.validated_at,
                    now,
                ],
                decision_from_row,
            )
            .optional()
            .map_err(|e| map_reference_error(e, "outcome"))?;
        row.ok_or_else(|| {
            GateError::Validation(format!(
                "outcome {}: unknown experiment arm {}/{}",
                o.decision_id, o.experiment_id, o.arm_id
            ))
        })
    }

    pub fn get_decision(&self, decision_id: &str) -> GateResult<Option<Decision>> {
        let sql = format!("SELECT {DECISION_COLUMNS} FROM decision_ledger WHERE decision_id = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![decision_id], decision_from_row)
            .optional()?)
    }

    /// Atomic 0 → 1 transition of downstream_applied on a validated row.
    pub fn claim_downstream(&self, decision_id: &str) -> GateResult<bool> {
        let changed = self.conn.execute(
            "UPDATE decision_ledger SET downstream_applied = 1
             WHERE decision_id = ?1 AND downstream_applied = 0 AND validated_at IS NOT NULL",
            params![decision_id],
        )?;
        Ok(changed == 1)
    }

    pub fn pending_downstream(&self, limit: usize) -> GateResult<Vec<Decision>> {
        let sql = format!(
            "SELECT {DECISION_COLUMNS} FROM decision_ledger
             WHERE downstream_applied = 0 AND validated_at IS NOT NULL
             ORDER BY validated_at ASC, decision_id ASC
             LIMIT ?1"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![limit as i64], decision_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Outcomes validated in [start, end), oldest first.
    pub fn validated_outcomes_between(
        &self,
        start: EpochMillis,
        end: EpochMillis,
    ) -> GateResult<Vec<ValidatedOutcome>> {
        let mut stmt = self.conn.prepare(
            "SELECT decision_id, stratum, arm_id, action, safety_flag,
                    (true_class = predicted_class AND safety_flag = 0) AS correct,
                    COALESCE(reward, 0.0), validated_at
             FROM decision_ledger
             WHERE validated_at IS NOT NULL AND validated_at >= ?1 AND validated_at < ?2
             ORDER BY validated_at ASC, decision_id ASC",
        )?;
        let rows = stmt
            .query_map(params![start, end], |row| {
                let action: String = row.get(3)?;
                Ok(ValidatedOutcome {
                    decision_id:  row.get(0)?,
                    stratum:      row.get(1)?,
                    arm_id:       row.get(2)?,
                    action:       Action::parse(&action).unwrap_or(Action::Defer),
                    safety_flag:  row.get::<_, i64>(4)? != 0,
                    correct:      row.get::<_, i64>(5)? != 0,
                    reward:       row.get(6)?,
                    validated_at: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn decisions_created_between(
        &self,
        start: EpochMillis,
        end: EpochMillis,
    ) -> GateResult<i64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM decision_ledger WHERE created_at >= ?1 AND created_at < ?2",
            params![start, end],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ── Test / summary helpers ────────────────────────────────────────

    pub fn decision_count(&self) -> GateResult<i64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM decision_ledger", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn decision_count_for(&self, decision_id: &str) -> GateResult<i64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM decision_ledger WHERE decision_id = ?1",
            params![decision_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

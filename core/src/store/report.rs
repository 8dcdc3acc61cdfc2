//! Store methods for append-only effectiveness reports.

use super::GateStore;
use crate::{error::GateResult, types::EpochMillis};
use rusqlite::{params, OptionalExtension};

/// Raw effectiveness_report row.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportRow {
    pub report_id:        i64,
    pub agent:            String,
    pub period_start:     EpochMillis,
    pub period_end:       EpochMillis,
    pub period_label:     String,
    pub metrics:          String,
    pub projection_drift: f64,
    pub accuracy_delta:   Option<f64>,
    pub recommendations:  String,
    pub created_at:       EpochMillis,
}

const REPORT_COLUMNS: &str = "report_id, agent, period_start, period_end, period_label, \
     metrics, projection_drift, accuracy_delta, recommendations, created_at";

fn report_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReportRow> {
    Ok(ReportRow {
        report_id:        row.get(0)?,
        agent:            row.get(1)?,
        period_start:     row.get(2)?,
        period_end:       row.get(3)?,
        period_label:     row.get(4)?,
        metrics:          row.get(5)?,
        projection_drift: row.get(6)?,
        accuracy_delta:   row.get(7)?,
        recommendations:  row.get(8)?,
        created_at:       row.get(9)?,
    })
}

impl GateStore {
    /// Append one report. Rows are immutable (enforced by triggers).
    pub fn insert_report(&self, r: &ReportRow) -> GateResult<i64> {
        self.conn.execute(
            "INSERT INTO effectiveness_report (
                agent, period_start, period_end, period_label, metrics,
                projection_drift, accuracy_delta, recommendations, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                r.agent,
                r.period_start,
                r.period_end,
                r.period_label,
                r.metrics,
                r.projection_drift,
                r.accuracy_delta,
                r.recommendations,
                r.created_at,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Most recent report for exactly this (agent, period).
    pub fn latest_report(
        &self,
        agent: &str,
        period_start: EpochMillis,
        period_end: EpochMillis,
    ) -> GateResult<Option<ReportRow>> {
        let sql = format!(
            "SELECT {REPORT_COLUMNS} FROM effectiveness_report
             WHERE agent = ?1 AND period_start = ?2 AND period_end = ?3
             ORDER BY report_id DESC LIMIT 1"
        );
        Ok(self
            .conn
            .query_row(&sql, params![agent, period_start, period_end], report_from_row)
            .optional()?)
    }

    pub fn report_count(&self, agent: &str) -> GateResult<i64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM effectiveness_report WHERE agent = ?1",
            params![agent],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

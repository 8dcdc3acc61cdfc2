//! Store methods for per-stratum safety counters.

use super::GateStore;
use crate::{
    error::GateResult,
    types::{EpochMillis, StratumState},
};
use rusqlite::{params, OptionalExtension};

/// Raw stratum_safety row.
#[derive(Debug, Clone, PartialEq)]
pub struct SafetyRow {
    pub stratum:         String,
    pub total_automated: i64,
    pub false_negatives: i64,
    pub state:           StratumState,
    pub quarantined:     bool,
}

impl GateStore {
    /// Create the counter row on first observation. No-op if it exists.
    pub fn ensure_stratum(&self, stratum: &str, now: EpochMillis) -> GateResult<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO stratum_safety (stratum, first_seen_at, updated_at)
             VALUES (?1, ?2, ?2)",
            params![stratum, now],
        )?;
        Ok(())
    }

    /// Atomic total_automated += 1, creating the row if needed.
    pub fn increment_total_automated(&self, stratum: &str, now: EpochMillis) -> GateResult<()> {
        self.conn.execute(
            "INSERT INTO stratum_safety (stratum, total_automated, first_seen_at, updated_at)
             VALUES (?1, 1, ?2, ?2)
             ON CONFLICT(stratum) DO UPDATE SET
                total_automated = total_automated + 1,
                updated_at      = excluded.updated_at",
            params![stratum, now],
        )?;
        Ok(())
    }

    /// Atomic false_negatives += 1, only while false_negatives < total_automated.
    /// Returns false when the guard rejected the increment (or no row exists).
    pub fn increment_false_negatives(&self, stratum: &str, now: EpochMillis) -> GateResult<bool> {
        let changed = self.conn.execute(
            "UPDATE stratum_safety
             SET false_negatives = false_negatives + 1, updated_at = ?2
             WHERE stratum = ?1 AND false_negatives < total_automated",
            params![stratum, now],
        )?;
        Ok(changed == 1)
    }

    pub fn get_safety_row(&self, stratum: &str) -> GateResult<Option<SafetyRow>> {
        Ok(self
            .conn
            .query_row(
                "SELECT stratum, total_automated, false_negatives, state, quarantined
                 FROM stratum_safety WHERE stratum = ?1",
                params![stratum],
                |row| {
                    let state: String = row.get(3)?;
                    Ok(SafetyRow {
                        stratum:         row.get(0)?,
                        total_automated: row.get(1)?,
                        false_negatives: row.get(2)?,
                        state:           StratumState::parse(&state)
                            .unwrap_or(StratumState::Unverified),
                        quarantined:     row.get::<_, i64>(4)? != 0,
                    })
                },
            )
            .optional()?)
    }

    /// Compare-and-set the policy meta-state. True if this call moved it.
    pub fn transition_state(
        &self,
        stratum: &str,
        from: StratumState,
        to: StratumState,
        now: EpochMillis,
    ) -> GateResult<bool> {
        let changed = self.conn.execute(
            "UPDATE stratum_safety SET state = ?3, updated_at = ?4
             WHERE stratum = ?1 AND state = ?2",
            params![stratum, from.as_str(), to.as_str(), now],
        )?;
        Ok(changed == 1)
    }

    /// Force a stratum to unverified and flag it for reconciliation.
    pub fn quarantine_stratum(&self, stratum: &str, now: EpochMillis) -> GateResult<()> {
        self.conn.execute(
            "INSERT INTO stratum_safety (stratum, quarantined, first_seen_at, updated_at)
             VALUES (?1, 1, ?2, ?2)
             ON CONFLICT(stratum) DO UPDATE SET
                quarantined = 1,
                state       = 'unverified',
                updated_at  = excluded.updated_at",
            params![stratum, now],
        )?;
        Ok(())
    }

    /// Clear the quarantine flag if the counters are consistent.
    pub fn clear_quarantine(&self, stratum: &str, now: EpochMillis) -> GateResult<bool> {
        let changed = self.conn.execute(
            "UPDATE stratum_safety SET quarantined = 0, updated_at = ?2
             WHERE stratum = ?1 AND quarantined = 1 AND false_negatives <= total_automated",
            params![stratum, now],
        )?;
        Ok(changed == 1)
    }

    /// Explicit cleanup: zero the counters and arm statistics of a stratum.
    pub fn reset_stratum_counters(&self, stratum: &str, now: EpochMillis) -> GateResult<bool> {
        let changed = self.conn.execute(
            "UPDATE stratum_safety
             SET total_automated = 0, false_negatives = 0, state = 'unverified',
                 quarantined = 0, updated_at = ?2
             WHERE stratum = ?1",
            params![stratum, now],
        )?;
        self.conn
            .execute("DELETE FROM arm_stats WHERE stratum = ?1", params![stratum])?;
        Ok(changed == 1)
    }

    pub fn all_safety_rows(&self) -> GateResult<Vec<SafetyRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT stratum, total_automated, false_negatives, state, quarantined
             FROM stratum_safety ORDER BY stratum ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let state: String = row.get(3)?;
                Ok(SafetyRow {
                    stratum:         row.get(0)?,
                    total_automated: row.get(1)?,
                    false_negatives: row.get(2)?,
                    state:           StratumState::parse(&state)
                        .unwrap_or(StratumState::Unverified),
                    quarantined:     row.get::<_, i64>(4)? != 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn quarantined_count(&self) -> GateResult<i64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM stratum_safety WHERE quarantined = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

//! Store methods for the experiment registry and per-stratum arm statistics.

use super::GateStore;
use crate::{
    error::{GateError, GateResult},
    policy::ArmStats,
    types::{Action, EpochMillis},
};
use rusqlite::params;

impl GateStore {
    /// Register an experiment and its arms. Idempotent; fails with
    /// Validation if an arm is already registered with another action.
    pub fn register_experiment(
        &self,
        experiment_id: &str,
        arms: &[(String, Action)],
        now: EpochMillis,
    ) -> GateResult<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO experiment (experiment_id, created_at) VALUES (?1, ?2)",
            params![experiment_id, now],
        )?;
        for (arm_id, action) in arms {
            self.conn.execute(
                "INSERT OR IGNORE INTO experiment_arm (experiment_id, arm_id, action)
                 VALUES (?1, ?2, ?3)",
                params![experiment_id, arm_id, action.as_str()],
            )?;
            let stored: String = self.conn.query_row(
                "SELECT action FROM experiment_arm WHERE experiment_id = ?1 AND arm_id = ?2",
                params![experiment_id, arm_id],
                |row| row.get(0),
            )?;
            if stored != action.as_str() {
                return Err(GateError::Validation(format!(
                    "arm {experiment_id}/{arm_id} already registered as '{stored}'"
                )));
            }
        }
        Ok(())
    }

    /// Atomic pulls += 1, reward_sum += reward.
    pub fn record_arm_reward(
        &self,
        stratum: &str,
        arm_id: &str,
        reward: f64,
        now: EpochMillis,
    ) -> GateResult<()> {
        self.conn.execute(
            "INSERT INTO arm_stats (stratum, arm_id, pulls, reward_sum, updated_at)
             VALUES (?1, ?2, 1, ?3, ?4)
             ON CONFLICT(stratum, arm_id) DO UPDATE SET
                pulls      = pulls + 1,
                reward_sum = reward_sum + excluded.reward_sum,
                updated_at = excluded.updated_at",
            params![stratum, arm_id, reward, now],
        )?;
        Ok(())
    }

    pub fn arm_stats(&self, stratum: &str) -> GateResult<Vec<ArmStats>> {
        let mut stmt = self.conn.prepare(
            "SELECT arm_id, pulls, reward_sum FROM arm_stats
             WHERE stratum = ?1 ORDER BY arm_id ASC",
        )?;
        let rows = stmt
            .query_map(params![stratum], |row| {
                Ok(ArmStats {
                    arm_id:     row.get(0)?,
                    pulls:      row.get(1)?,
                    reward_sum: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

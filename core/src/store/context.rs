//! Store methods for context model state and its parameter history.

use super::{decode_f64s, encode_f64s, GateStore};
use crate::{
    context_model::{ContextMemory, ContextModel},
    error::{GateError, GateResult},
    types::EpochMillis,
};
use rusqlite::{params, OptionalExtension};

/// One row of context_history, parameters flattened as projection ++ readout ++ [bias].
#[derive(Debug, Clone, PartialEq)]
pub struct ContextSnapshot {
    pub agent:       String,
    pub version:     i64,
    pub recorded_at: EpochMillis,
    pub parameters:  Vec<f64>,
}

impl GateStore {
    /// Load an agent's model. `memory_capacity` caps the restored window
    /// (the configured capacity wins over whatever was stored).
    pub fn load_context(
        &self,
        agent: &str,
        memory_capacity: usize,
    ) -> GateResult<Option<ContextModel>> {
        let raw = self
            .conn
            .query_row(
                "SELECT input_dim, feature_dim, projection, readout, bias, update_count, memory
                 FROM context_state WHERE agent = ?1",
                params![agent],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, Vec<u8>>(3)?,
                        row.get::<_, f64>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()?;

        let Some((d, k, projection, readout, bias, update_count, memory)) = raw else {
            return Ok(None);
        };
        if d <= 0 || k <= 0 {
            return Err(GateError::Shape(format!(
                "agent {agent}: stored dimensions {k}x{d} are invalid"
            )));
        }
        let (d, k) = (d as usize, k as usize);
        let entries: Vec<(String, f64)> = serde_json::from_str(&memory)?;

        Ok(Some(ContextModel {
            agent:        agent.to_string(),
            input_dim:    d,
            feature_dim:  k,
            projection:   decode_f64s(&projection, k * d)?,
            readout:      decode_f64s(&readout, k)?,
            bias,
            update_count: update_count.max(0) as u64,
            memory:       ContextMemory::from_entries(memory_capacity, entries),
        }))
    }

    /// Insert or replace the agent's row.
    pub fn save_context(&self, model: &ContextModel, now: EpochMillis) -> GateResult<()> {
        let memory: Vec<&(String, f64)> = model.memory.entries().collect();
        self.conn.execute(
            "INSERT INTO context_state (
                agent, input_dim, feature_dim, projection, readout, bias,
                update_count, memory, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(agent) DO UPDATE SET
                input_dim    = excluded.input_dim,
                feature_dim  = excluded.feature_dim,
                projection   = excluded.projection,
                readout      = excluded.readout,
                bias         = excluded.bias,
                update_count = excluded.update_count,
                memory       = excluded.memory,
                updated_at   = excluded.updated_at",
            params![
                model.agent,
                model.input_dim as i64,
                model.feature_dim as i64,
                encode_f64s(&model.projection),
                encode_f64s(&model.readout),
                model.bias,
                model.update_count as i64,
                serde_json::to_string(&memory)?,
                now,
            ],
        )?;
        Ok(())
    }

    /// Append a history snapshot keyed by the model's update count.
    pub fn append_context_snapshot(&self, model: &ContextModel, now: EpochMillis) -> GateResult<i64> {
        let version = model.update_count as i64;
        self.conn.execute(
            "INSERT OR IGNORE INTO context_history (agent, version, recorded_at, projection, readout, bias)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                model.agent,
                version,
                now,
                encode_f64s(&model.projection),
                encode_f64s(&model.readout),
                model.bias,
            ],
        )?;
        Ok(version)
    }

    /// Latest snapshot recorded at or before `at`.
    pub fn context_snapshot_at_or_before(
        &self,
        agent: &str,
        at: EpochMillis,
    ) -> GateResult<Option<ContextSnapshot>> {
        self.query_snapshot(
            "SELECT version, recorded_at, projection, readout, bias FROM context_history
             WHERE agent = ?1 AND recorded_at <= ?2
             ORDER BY recorded_at DESC, version DESC LIMIT 1",
            agent,
            Some(at),
        )
    }

    pub fn earliest_context_snapshot(&self, agent: &str) -> GateResult<Option<ContextSnapshot>> {
        self.query_snapshot(
            "SELECT version, recorded_at, projection, readout, bias FROM context_history
             WHERE agent = ?1
             ORDER BY version ASC LIMIT 1",
            agent,
            None,
        )
    }

    pub fn context_snapshot_count(&self, agent: &str) -> GateResult<i64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM context_history WHERE agent = ?1",
            params![agent],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn query_snapshot(
        &self,
        sql: &str,
        agent: &str,
        at: Option<EpochMillis>,
    ) -> GateResult<Option<ContextSnapshot>> {
        let map = |row: &rusqlite::Row<'_>| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Vec<u8>>(2)?,
                row.get::<_, Vec<u8>>(3)?,
                row.get::<_, f64>(4)?,
            ))
        };
        let raw = match at {
            Some(at) => self.conn.query_row(sql, params![agent, at], map).optional()?,
            None => self.conn.query_row(sql, params![agent], map).optional()?,
        };
        let Some((version, recorded_at, projection, readout, bias)) = raw else {
            return Ok(None);
        };
        let mut parameters = decode_f64s(&projection, projection.len() / 8)?;
        parameters.extend(decode_f64s(&readout, readout.len() / 8)?);
        parameters.push(bias);
        Ok(Some(ContextSnapshot {
            agent: agent.to_string(),
            version,
            recorded_at,
            parameters,
        }))
    }
}

//! SQLite persistence layer.
//!
//! RULE: Only store/ talks to the database.
//! Components call store methods; they never execute SQL directly.
//!
//! Shared counters and ledger rows are mutated with single-statement
//! atomic SQL (UPDATE x = x + 1, INSERT ... ON CONFLICT DO UPDATE), never
//! read-then-write. Each worker owns one GateStore (one connection);
//! SQLite's busy timeout provides the bounded retry under contention.

use crate::{
    error::{GateError, GateResult},
    event::{EventLogEntry, GateEvent},
    types::EpochMillis,
};
use rusqlite::{ffi, params, Connection, Transaction, TransactionBehavior};
use std::time::Duration;

mod context;
mod ledger;
mod policy;
mod report;
mod safety;

pub use context::ContextSnapshot;
pub use ledger::ValidatedOutcome;
pub use report::ReportRow;
pub use safety::SafetyRow;

pub struct GateStore {
    conn: Connection,
    path: Option<String>, // None for :memory:, Some(path) for file
}

impl GateStore {
    pub fn open(path: &str) -> GateResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (:memory: ignores it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn,
            path: Some(path.to_string()),
        })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> GateResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn, path: None })
    }

    /// Reopen a new connection to the same database.
    /// For in-memory databases, this returns a new in-memory database (isolated).
    /// For file-based databases, this opens the same file.
    pub fn reopen(&self) -> GateResult<Self> {
        match &self.path {
            Some(p) => Self::open(p),
            None => Self::in_memory(),
        }
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// How long a statement waits on a locked database before giving up.
    pub fn set_busy_timeout(&self, timeout: Duration) -> GateResult<()> {
        self.conn.busy_timeout(timeout)?;
        Ok(())
    }

    /// Apply all schema migrations in order. Safe to run on every open.
    pub fn migrate(&self) -> GateResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_foundation.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/002_decision_ledger.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/003_safety_counters.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/004_context_model.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/005_effectiveness_report.sql"))?;
        Ok(())
    }

    /// Run `f` inside one IMMEDIATE transaction on this connection. The write
    /// lock is taken up front, so the busy timeout applies at BEGIN rather
    /// than on a later read-to-write upgrade. Any error rolls everything
    /// back. Not re-entrant.
    pub fn with_transaction<T>(&self, f: impl FnOnce(&Self) -> GateResult<T>) -> GateResult<T> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let out = f(self)?;
        tx.commit()?;
        Ok(out)
    }

    // ── Event log ──────────────────────────────────────────────

    pub fn append_event(&self, entry: &EventLogEntry) -> GateResult<()> {
        self.conn.execute(
            "INSERT INTO gate_event (occurred_at, component, event_type, payload)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.occurred_at,
                entry.component,
                entry.event_type,
                entry.payload,
            ],
        )?;
        Ok(())
    }

    /// Serialize and append one event.
    pub fn record_event(
        &self,
        occurred_at: EpochMillis,
        component: &str,
        event: &GateEvent,
    ) -> GateResult<()> {
        let entry = EventLogEntry::new(occurred_at, component, event)?;
        self.append_event(&entry)
    }

    pub fn events_of_type(&self, event_type: &str) -> GateResult<Vec<EventLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, occurred_at, component, event_type, payload
             FROM gate_event WHERE event_type = ?1
             ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map(params![event_type], |row| {
                Ok(EventLogEntry {
                    id: Some(row.get(0)?),
                    occurred_at: row.get(1)?,
                    component: row.get(2)?,
                    event_type: row.get(3)?,
                    payload: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn event_count(&self) -> GateResult<i64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM gate_event", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Delete events strictly older than `cutoff`. Returns rows removed.
    pub fn prune_events_before(&self, cutoff: EpochMillis) -> GateResult<usize> {
        let removed = self.conn.execute(
            "DELETE FROM gate_event WHERE occurred_at < ?1",
            params![cutoff],
        )?;
        Ok(removed)
    }
}

// ── Blob / error helpers shared by the store modules ──────────────

/// Pack a fixed-shape f64 array as little-endian bytes.
pub(crate) fn encode_f64s(values: &[f64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Unpack a little-endian f64 blob, checking its length.
pub(crate) fn decode_f64s(bytes: &[u8], expected_len: usize) -> GateResult<Vec<f64>> {
    if bytes.len() != expected_len * 8 {
        return Err(GateError::Shape(format!(
            "stored array has {} bytes, expected {} values",
            bytes.len(),
            expected_len
        )));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|c| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(c);
            f64::from_le_bytes(buf)
        })
        .collect())
}

/// Translate SQLite foreign-key / uniqueness failures into the gate's
/// Validation taxonomy; everything else stays a Database error.
pub(crate) fn map_reference_error(err: rusqlite::Error, what: &str) -> GateError {
    if let rusqlite::Error::SqliteFailure(ref e, _) = err {
        match e.extended_code {
            ffi::SQLITE_CONSTRAINT_FOREIGNKEY => {
                return GateError::Validation(format!("{what}: referenced id does not exist"));
            }
            ffi::SQLITE_CONSTRAINT_PRIMARYKEY | ffi::SQLITE_CONSTRAINT_UNIQUE => {
                return GateError::Validation(format!("{what}: id already exists"));
            }
            _ => {}
        }
    }
    GateError::Database(err)
}

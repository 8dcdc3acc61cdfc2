//! Gate clock: wall time in production, a manually advanced time in tests.
//!
//! Every timestamp the gate writes (decision creation, validation time,
//! report windows, event log) comes from a GateClock so that tests and the
//! seeded workload harness are reproducible.

use crate::types::EpochMillis;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct GateClock {
    source: ClockSource,
}

#[derive(Debug, Clone)]
enum ClockSource {
    System,
    /// Shared between clones so every worker sees the same manual time.
    Manual(Arc<AtomicI64>),
}

impl GateClock {
    pub fn system() -> Self {
        Self { source: ClockSource::System }
    }

    pub fn manual(start: DateTime<Utc>) -> Self {
        Self {
            source: ClockSource::Manual(Arc::new(AtomicI64::new(start.timestamp_millis()))),
        }
    }

    pub fn is_manual(&self) -> bool {
        matches!(self.source, ClockSource::Manual(_))
    }

    pub fn now(&self) -> DateTime<Utc> {
        from_millis(self.now_millis())
    }

    pub fn now_millis(&self) -> EpochMillis {
        match &self.source {
            ClockSource::System => Utc::now().timestamp_millis(),
            ClockSource::Manual(ms) => ms.load(Ordering::SeqCst),
        }
    }

    /// Move a manual clock forward. Panics on the system clock; callers must check.
    pub fn advance(&self, by: Duration) {
        match &self.source {
            ClockSource::System => panic!("advance() called on system clock"),
            ClockSource::Manual(ms) => {
                ms.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
            }
        }
    }

    /// Jump a manual clock to `at`. Panics on the system clock.
    pub fn set(&self, at: DateTime<Utc>) {
        match &self.source {
            ClockSource::System => panic!("set() called on system clock"),
            ClockSource::Manual(ms) => ms.store(at.timestamp_millis(), Ordering::SeqCst),
        }
    }
}

pub fn from_millis(ms: EpochMillis) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_default()
}

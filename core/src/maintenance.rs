//! Maintenance runner — the gate's cron, off the decision hot path.
//!
//! One pass:
//!   1. Prune audit events older than the retention window.
//!   2. Write fail-closed decisions queued while the ledger was locked.
//!   3. Replay downstream aggregation for validated-but-unclaimed rows.
//!   4. Append the effectiveness report for the last completed period if
//!      none exists yet.
//!
//! The runner owns its own Gate worker (its own connection). `spawn` runs
//! passes on a background thread until the handle is stopped.

use crate::{
    error::{GateError, GateResult},
    event::GateEvent,
    gate::Gate,
    reporter::ReportPeriod,
};
use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const COMPONENT: &str = "maintenance";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub events_pruned:     usize,
    pub decisions_flushed: usize,
    pub outcomes_replayed: usize,
    pub reports_appended:  usize,
}

pub struct MaintenanceRunner {
    gate: Gate,
}

impl MaintenanceRunner {
    pub fn new(gate: Gate) -> Self {
        Self { gate }
    }

    pub fn gate(&self) -> &Gate {
        &self.gate
    }

    pub fn run_once(&self) -> GateResult<MaintenanceReport> {
        let cfg = &self.gate.config().maintenance;
        let now = self.gate.clock().now();
        let mut report = MaintenanceReport::default();

        let cutoff = now - ChronoDuration::days(cfg.event_retention_days);
        report.events_pruned = self
            .gate
            .store()
            .prune_events_before(cutoff.timestamp_millis())?;
        if report.events_pruned > 0 {
            self.gate.store().record_event(
                now.timestamp_millis(),
                COMPONENT,
                &GateEvent::EventsPruned { removed: report.events_pruned },
            )?;
        }

        report.decisions_flushed = self.gate.flush_unrecorded()?;
        report.outcomes_replayed = self.gate.replay_pending(cfg.replay_batch_size)?;

        let period = ReportPeriod::last_complete(now, self.gate.config().report.period_hours)?;
        let agent = self.gate.agent().to_string();
        if !self.gate.reporter().exists(&agent, &period)? {
            self.gate.generate_report(&agent, &period)?;
            report.reports_appended = 1;
        }

        log::info!(
            "maintenance pass: pruned={} flushed={} replayed={} reports={}",
            report.events_pruned,
            report.decisions_flushed,
            report.outcomes_replayed,
            report.reports_appended
        );
        Ok(report)
    }

    /// Run passes every `interval` on a background thread. A failed pass is
    /// logged and retried on the next tick.
    pub fn spawn(self, interval: Duration) -> MaintenanceHandle {
        let (stop, stopped) = mpsc::channel::<()>();
        let thread = thread::spawn(move || loop {
            if let Err(e) = self.run_once() {
                log::error!("maintenance pass failed: {e}");
            }
            match stopped.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        });
        MaintenanceHandle { stop, thread }
    }
}

pub struct MaintenanceHandle {
    stop:   Sender<()>,
    thread: JoinHandle<()>,
}

impl MaintenanceHandle {
    /// Signal the runner and wait for the current pass to finish.
    pub fn stop(self) -> GateResult<()> {
        let _ = self.stop.send(());
        self.thread
            .join()
            .map_err(|_| GateError::Other(anyhow::anyhow!("maintenance thread panicked")))
    }
}

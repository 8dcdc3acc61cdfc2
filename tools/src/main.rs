//! gate-runner: headless driver for the safety gate.
//!
//! Usage:
//!   gate-runner --seed 12345 --decisions 5000 --db gate.db
//!   gate-runner --seed 12345 --decisions 20000 --workers 4 --db gate.db
//!   gate-runner --db gate.db --ipc-mode      (JSON lines on stdin/stdout)

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use gatekeeper_core::{
    clock::GateClock,
    config::GateConfig,
    gate::{Gate, OutcomeSubmission},
    maintenance::MaintenanceRunner,
    reporter::ReportPeriod,
    stratum::StratumContext,
    workload::{default_profiles, drive, WorkloadGenerator, WorkloadSummary},
};
use std::env;
use std::io::{self, BufRead, Write};
use std::thread;

#[derive(serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum IpcCommand {
    Evaluate {
        #[serde(default)]
        decision_id: Option<String>,
        stratum_context: StratumContext,
        prediction: String,
        confidence: f64,
    },
    SubmitOutcome(OutcomeSubmission),
    SafetyStatus {
        stratum: String,
    },
    Report {
        #[serde(default)]
        agent: Option<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        /// Append a fresh report instead of reading the latest one.
        #[serde(default)]
        generate: bool,
    },
    Quit,
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let seed = parse_arg(&args, "--seed", 42u64);
    let decisions = parse_arg(&args, "--decisions", 2_000u64);
    let workers = parse_arg(&args, "--workers", 1usize).max(1);
    let ipc_mode = args.iter().any(|a| a == "--ipc-mode");
    let db = args
        .windows(2)
        .find(|w| w[0] == "--db")
        .map(|w| w[1].as_str())
        .unwrap_or(":memory:");
    let data_dir = args
        .windows(2)
        .find(|w| w[0] == "--data-dir")
        .map(|w| w[1].as_str())
        .unwrap_or("./data");

    let config = GateConfig::load(data_dir)?;

    if !ipc_mode {
        println!("Safety gate — gate-runner");
        println!("  seed:      {seed}");
        println!("  decisions: {decisions}");
        println!("  workers:   {workers}");
        println!("  db:        {db}");
        println!("  data_dir:  {data_dir}");
        println!();
    }

    if ipc_mode {
        if db == ":memory:" {
            let gate = Gate::in_memory(config, GateClock::system())?;
            return run_ipc_loop(&gate);
        }
        // File-backed: maintenance runs beside the loop on its own connection.
        let gate = Gate::open(db, config, GateClock::system())?;
        let interval = std::time::Duration::from_secs(gate.config().maintenance.interval_secs);
        let maintenance = MaintenanceRunner::new(gate.worker()?).spawn(interval);
        let result = run_ipc_loop(&gate);
        maintenance.stop()?;
        return result;
    }

    // Workers need a shared file; an in-memory run with several workers
    // goes to a scratch file instead.
    let db_effective = if db == ":memory:" && workers > 1 {
        env::temp_dir()
            .join(format!("gate_run_{seed}_{}.db", unix_secs()))
            .to_string_lossy()
            .into_owned()
    } else {
        db.to_string()
    };

    let start = Utc
        .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .context("fixed run epoch")?;
    let clock = GateClock::manual(start);
    let gate = if db_effective == ":memory:" {
        Gate::in_memory(config, clock)?
    } else {
        Gate::open(&db_effective, config, clock)?
    };

    let summary = run_batch(&gate, seed, decisions, workers)?;

    let replayed = gate.replay_pending(gate.config().maintenance.replay_batch_size)?;
    let end = gate.clock().now() + Duration::milliseconds(1);
    let report = gate.generate_report(gate.agent(), &ReportPeriod::new(start, end)?)?;

    print_summary(&gate, &summary, replayed)?;
    println!();
    println!("=== EFFECTIVENESS REPORT #{} ({}) ===", report.report_id, report.period.label());
    println!("  validated outcomes: {}", report.metrics.outcomes_validated);
    println!("  window fnr:         {:.4}", report.metrics.window_fnr);
    println!("  projection drift:   {:.4}", report.projection_drift);
    match report.accuracy_delta {
        Some(d) => println!("  accuracy delta:     {d:+.4}"),
        None => println!("  accuracy delta:     n/a"),
    }
    for r in &report.recommendations {
        println!("  - {r}");
    }
    Ok(())
}

fn run_batch(gate: &Gate, seed: u64, decisions: u64, workers: usize) -> Result<WorkloadSummary> {
    let labels = gate.config().outcome.class_labels.clone();
    let step = Duration::seconds(30);

    if workers == 1 {
        let mut generator = WorkloadGenerator::new(seed, default_profiles(), labels);
        return Ok(drive(gate, &mut generator, decisions, step)?);
    }

    let per_worker = decisions / workers as u64;
    let mut handles = Vec::with_capacity(workers);
    for lane in 0..workers {
        let worker = gate.worker()?;
        let labels = labels.clone();
        let n = if lane == 0 {
            per_worker + decisions % workers as u64
        } else {
            per_worker
        };
        handles.push(thread::spawn(move || -> Result<WorkloadSummary> {
            let mut generator =
                WorkloadGenerator::for_lane(seed, lane as u64, default_profiles(), labels);
            Ok(drive(&worker, &mut generator, n, step)?)
        }));
    }

    let mut total = WorkloadSummary::default();
    for handle in handles {
        let s = handle
            .join()
            .map_err(|_| anyhow::anyhow!("worker thread panicked"))??;
        total.decisions += s.decisions;
        total.automated += s.automated;
        total.deferred += s.deferred;
        total.false_negatives += s.false_negatives;
        total.automated_false_negatives += s.automated_false_negatives;
    }
    let statuses = gate.all_safety_statuses()?;
    total.verified_strata = statuses
        .iter()
        .filter(|s| s.state == gatekeeper_core::types::StratumState::Verified)
        .count();
    total.quarantined_strata = statuses.iter().filter(|s| s.quarantined).count();
    Ok(total)
}

fn run_ipc_loop(gate: &Gate) -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut handle = stdin.lock();
    let mut buffer = String::new();

    loop {
        buffer.clear();
        let bytes_read = handle.read_line(&mut buffer)?;
        if bytes_read == 0 {
            break; // EOF
        }
        if buffer.trim().is_empty() {
            continue;
        }

        let cmd: IpcCommand = match serde_json::from_str(&buffer) {
            Ok(c) => c,
            Err(e) => {
                let err_json = serde_json::json!({ "error": e.to_string() });
                writeln!(stdout, "{}", err_json)?;
                stdout.flush()?;
                continue;
            }
        };

        if let IpcCommand::Quit = cmd {
            break;
        }
        let reply = match handle_command(gate, cmd) {
            Ok(value) => value,
            Err(e) => serde_json::json!({ "error": e.to_string() }),
        };
        writeln!(stdout, "{}", reply)?;
        stdout.flush()?;
    }
    Ok(())
}

fn handle_command(gate: &Gate, cmd: IpcCommand) -> Result<serde_json::Value> {
    let value = match cmd {
        IpcCommand::Evaluate {
            decision_id,
            stratum_context,
            prediction,
            confidence,
        } => {
            let response = match decision_id {
                Some(id) => gate.evaluate_as(&id, &stratum_context, &prediction, confidence)?,
                None => gate.evaluate(&stratum_context, &prediction, confidence)?,
            };
            serde_json::to_value(response)?
        }
        IpcCommand::SubmitOutcome(submission) => {
            serde_json::to_value(gate.submit_outcome(&submission)?)?
        }
        IpcCommand::SafetyStatus { stratum } => {
            serde_json::to_value(gate.get_safety_status(&stratum)?)?
        }
        IpcCommand::Report {
            agent,
            start,
            end,
            generate,
        } => {
            let agent = agent.unwrap_or_else(|| gate.agent().to_string());
            let period = ReportPeriod::new(start, end)?;
            let report = if generate {
                gate.generate_report(&agent, &period)?
            } else {
                gate.get_effectiveness_report(&agent, &period)?
            };
            serde_json::to_value(report)?
        }
        IpcCommand::Quit => serde_json::Value::Null,
    };
    Ok(value)
}

fn print_summary(gate: &Gate, summary: &WorkloadSummary, replayed: usize) -> Result<()> {
    println!("=== RUN SUMMARY ===");
    println!("  decisions:          {}", summary.decisions);
    println!("  automated:          {}", summary.automated);
    println!("  deferred:           {}", summary.deferred);
    println!("  false negatives:    {}", summary.false_negatives);
    println!("  automated misses:   {}", summary.automated_false_negatives);
    println!("  verified strata:    {}", summary.verified_strata);
    println!("  quarantined strata: {}", summary.quarantined_strata);
    println!("  replayed outcomes:  {replayed}");
    println!("  ledger rows:        {}", gate.store().decision_count()?);

    println!();
    println!("=== STRATA ===");
    for s in gate.all_safety_statuses()? {
        println!(
            "  {:<48} {:<10} n={:<6} fn={:<4} ub={:.4}{}",
            s.stratum,
            s.state.as_str(),
            s.total_automated,
            s.false_negatives,
            s.upper_bound,
            if s.quarantined { " QUARANTINED" } else { "" }
        );
    }
    Ok(())
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}

fn unix_secs() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// SPDX-License-Identifier: PMPL-1.0-or-later

//! Parallel distance minimization.
//!
//! A coordinator drives a pool of search workers, each independently
//! generating candidate sequences and evaluating them through the oracle.
//! Workers and coordinator communicate only through channels: a per-worker
//! control channel (bound broadcasts, shutdown), a per-worker report channel
//! (execution/error counters), and one shared result channel. The
//! coordinator owns all aggregate state; nothing is shared.
//!
//! Bound broadcasts are advisory: a worker may evaluate a few candidates
//! against a stale bound before its next poll, and the coordinator re-checks
//! every arriving result against its own record before accepting it.

mod worker;

use crate::generate::CandidateGenerator;
use crate::oracle::{Materialize, OracleRunner};
use crate::types::{RunConfig, RunOutcome};
use anyhow::{bail, ensure, Context, Result};
use colored::Colorize;
use std::fs;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How often a worker with unreported activity sends its counters.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(10);

/// Coordinator wait on the shared result channel; also the granularity of
/// the budget checks.
const RESULT_WAIT: Duration = Duration::from_secs(1);

/// Escalating waits for workers to exit after the shutdown notice.
const SHUTDOWN_WAITS: [Duration; 2] = [Duration::from_millis(100), Duration::from_secs(1)];

pub const NEG_TRIGGER_FILE: &str = "neg_trigger.txt";
pub const POS_TRIGGER_FILE: &str = "pos_trigger.txt";

/// Coordinator → worker.
pub(crate) enum Control {
    /// A raw distance some worker improved on; prune against it.
    Bound(i64),
    Shutdown,
}

/// Worker → coordinator counters. Always a delta, never a total.
pub(crate) struct Report {
    pub execs: u64,
    pub errors: u64,
}

/// Worker → coordinator improvement.
pub(crate) struct Found {
    pub lines: Vec<String>,
    /// Raw oracle distance; the coordinator adjusts it.
    pub distance: i64,
    pub execs: u64,
    pub errors: u64,
}

struct WorkerHandle {
    handle: JoinHandle<()>,
    control_tx: Sender<Control>,
    report_rx: Receiver<Report>,
}

struct ProgressPoint {
    secs: u64,
    execs: u64,
    best_pos: Option<i64>,
    best_neg: Option<i64>,
}

enum StopReason {
    Cutoff,
    ExecBudget,
    TimeBudget,
    WorkerDeath,
}

/// Run one minimization with workers built from the configured preset.
pub fn run(config: &RunConfig, starting_config: &[String], output_dir: &Path) -> Result<RunOutcome> {
    let runner = OracleRunner::new(
        config.oracle.clone(),
        Materialize::Trace {
            starting_config: starting_config.to_vec(),
        },
    );
    let preset = config.generator;
    let (first, second) = (config.first_size, config.second_size);
    let time_limit = config.time_limit.map(Duration::from_secs);
    run_with(config, output_dir, runner, move || {
        preset.build(first, second, time_limit)
    })
}

/// Run one minimization with an explicit oracle runner and generator
/// factory. The factory is called once per worker; each worker owns its
/// generator and RNG stream.
pub fn run_with<F>(
    config: &RunConfig,
    output_dir: &Path,
    runner: OracleRunner,
    factory: F,
) -> Result<RunOutcome>
where
    F: Fn() -> Box<dyn CandidateGenerator>,
{
    fs::create_dir_all(output_dir)
        .with_context(|| format!("creating output directory {}", output_dir.display()))?;

    let (result_tx, result_rx) = mpsc::channel::<Found>();
    let mut workers = Vec::with_capacity(config.jobs);
    for _ in 0..config.jobs {
        let (control_tx, control_rx) = mpsc::channel();
        let (report_tx, report_rx) = mpsc::channel();
        let generator = factory();
        let runner = runner.clone();
        let result_tx = result_tx.clone();
        let handle =
            thread::spawn(move || worker::search_loop(generator, runner, control_rx, report_tx, result_tx));
        workers.push(WorkerHandle {
            handle,
            control_tx,
            report_rx,
        });
    }
    // Keep the result channel's only senders inside the workers, so a fully
    // dead pool surfaces as a disconnect.
    drop(result_tx);

    let neg_trigger = output_dir.join(NEG_TRIGGER_FILE);
    let pos_trigger = output_dir.join(POS_TRIGGER_FILE);
    let time_limit = config.time_limit.map(Duration::from_secs);
    let start = Instant::now();

    let mut outcome = RunOutcome::default();
    let mut best_neg: Option<i64> = None;
    let mut best_pos: Option<i64> = None;
    let mut total_execs: u64 = 0;
    let mut total_errors: u64 = 0;
    let mut progress: Vec<ProgressPoint> = Vec::new();

    let reason = loop {
        if let Some(limit) = time_limit {
            if start.elapsed() >= limit {
                break StopReason::TimeBudget;
            }
        }
        if let Some(limit) = config.execution_limit {
            if total_execs > limit {
                break StopReason::ExecBudget;
            }
        }
        if workers.iter().any(|w| w.handle.is_finished()) {
            break StopReason::WorkerDeath;
        }

        let mut report_change = false;
        for worker in &workers {
            while let Ok(report) = worker.report_rx.try_recv() {
                total_execs += report.execs;
                total_errors += report.errors;
                report_change = true;
            }
        }
        if report_change {
            log_running_totals(start, best_pos, best_neg, total_execs, total_errors);
        }

        match result_rx.recv_timeout(RESULT_WAIT) {
            Ok(found) => {
                total_execs += found.execs;
                total_errors += found.errors;

                if found.distance <= 0 {
                    // First block placed before the second: the gap is the
                    // raw distance plus the first block's own size.
                    let adjusted = found.distance + config.first_size as i64;
                    ensure!(
                        adjusted <= 0,
                        "oracle reported distance {} inside the first block (size {})",
                        found.distance,
                        config.first_size
                    );
                    if best_neg.map_or(true, |b| adjusted > b) {
                        best_neg = Some(adjusted);
                        outcome.record_neg(adjusted, start.elapsed().as_secs_f64(), total_execs);
                        write_trigger(&neg_trigger, &runner, &found.lines)?;
                        println!(
                            "{} {} ({})",
                            "min. negative distance is now".green(),
                            adjusted,
                            neg_trigger.display()
                        );
                        progress.push(ProgressPoint {
                            secs: start.elapsed().as_secs(),
                            execs: total_execs,
                            best_pos,
                            best_neg,
                        });
                        broadcast_bound(&workers, found.distance);
                    }
                } else {
                    // First block placed after the second: subtract the
                    // second block's size.
                    let adjusted = found.distance - config.second_size as i64;
                    ensure!(
                        adjusted >= 0,
                        "oracle reported distance {} inside the second block (size {})",
                        found.distance,
                        config.second_size
                    );
                    if best_pos.map_or(true, |b| adjusted < b) {
                        best_pos = Some(adjusted);
                        outcome.record_pos(adjusted, start.elapsed().as_secs_f64(), total_execs);
                        write_trigger(&pos_trigger, &runner, &found.lines)?;
                        println!(
                            "{} {} ({})",
                            "min. positive distance is now".green(),
                            adjusted,
                            pos_trigger.display()
                        );
                        progress.push(ProgressPoint {
                            secs: start.elapsed().as_secs(),
                            execs: total_execs,
                            best_pos,
                            best_neg,
                        });
                        broadcast_bound(&workers, found.distance);
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break StopReason::WorkerDeath,
        }

        if outcome.solved(config.cutoff) {
            break StopReason::Cutoff;
        }
    };

    outcome.total_secs = start.elapsed().as_secs_f64();

    match reason {
        StopReason::Cutoff => println!(
            "discovered distances within the cutoff. shutting down workers ..."
        ),
        StopReason::ExecBudget => println!("execution limit exceeded. shutting down workers ..."),
        StopReason::TimeBudget => println!("time limit expired. shutting down workers ..."),
        StopReason::WorkerDeath => {
            println!("{}", "a search worker died. shutting down ...".red())
        }
    }

    let (execs, errors) = shutdown_workers(workers);
    total_execs += execs;
    total_errors += errors;
    outcome.total_execs = total_execs;
    outcome.total_errors = total_errors;

    println!(
        "{} successful executions. {} errors.",
        total_execs.saturating_sub(total_errors),
        total_errors
    );
    println!("=== progress report ===");
    for point in &progress {
        println!(
            "time: {}s, execs: {}, pos: {:?}, neg: {:?}",
            point.secs, point.execs, point.best_pos, point.best_neg
        );
    }
    println!("=== end progress report ===");

    if matches!(reason, StopReason::WorkerDeath) {
        bail!("a search worker exited unexpectedly; aborting run ({config})");
    }

    Ok(outcome)
}

fn log_running_totals(
    start: Instant,
    best_pos: Option<i64>,
    best_neg: Option<i64>,
    total_execs: u64,
    total_errors: u64,
) {
    let run_time = start.elapsed().as_secs_f64();
    println!(
        "min. pos: {:?}. min. neg: {:?}. run time {:.2}s. {:.2} executions per second. \
         {} successful executions. {} errors.",
        best_pos,
        best_neg,
        run_time,
        total_execs as f64 / run_time.max(f64::EPSILON),
        total_execs.saturating_sub(total_errors),
        total_errors
    );
}

fn broadcast_bound(workers: &[WorkerHandle], raw_distance: i64) {
    for worker in workers {
        let _ = worker.control_tx.send(Control::Bound(raw_distance));
    }
}

/// Persist a reproducer: the fully materialized oracle input with the stage
/// marker spliced in directly after the first named allocation.
fn write_trigger(path: &Path, runner: &OracleRunner, candidate: &[String]) -> Result<()> {
    let out = runner.materialize().render(candidate, true);
    fs::write(path, out).with_context(|| format!("writing reproducer {}", path.display()))
}

/// Notify every worker, then collect exits in escalating passes. Whatever
/// still runs after the final pass is abandoned: dropping its handles hangs
/// up its control channel, so it exits on its next poll, just without a
/// collected report.
fn shutdown_workers(mut workers: Vec<WorkerHandle>) -> (u64, u64) {
    for worker in &workers {
        let _ = worker.control_tx.send(Control::Shutdown);
    }

    let mut total_execs = 0;
    let mut total_errors = 0;
    for wait in SHUTDOWN_WAITS {
        workers = collect_exited(workers, wait, &mut total_execs, &mut total_errors);
        if workers.is_empty() {
            return (total_execs, total_errors);
        }
        println!("{} workers still running. waiting a little longer ...", workers.len());
    }

    for worker in &workers {
        while let Ok(report) = worker.report_rx.try_recv() {
            total_execs += report.execs;
            total_errors += report.errors;
        }
    }
    println!("{} workers still running. abandoning them ...", workers.len());

    (total_execs, total_errors)
}

fn collect_exited(
    workers: Vec<WorkerHandle>,
    wait: Duration,
    total_execs: &mut u64,
    total_errors: &mut u64,
) -> Vec<WorkerHandle> {
    let mut alive = Vec::new();
    for worker in workers {
        while let Ok(report) = worker.report_rx.try_recv() {
            *total_execs += report.execs;
            *total_errors += report.errors;
        }

        let deadline = Instant::now() + wait;
        while !worker.handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        if worker.handle.is_finished() {
            while let Ok(report) = worker.report_rx.try_recv() {
                *total_execs += report.execs;
                *total_errors += report.errors;
            }
            let _ = worker.handle.join();
        } else {
            alive.push(worker);
        }
    }
    alive
}

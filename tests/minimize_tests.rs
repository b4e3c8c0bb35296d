// SPDX-License-Identifier: PMPL-1.0-or-later

//! End-to-end coordinator tests against stub oracles.

use heapgap::generate::CandidateGenerator;
use heapgap::minimize::{self, NEG_TRIGGER_FILE, POS_TRIGGER_FILE};
use heapgap::oracle::{Materialize, OracleRunner};
use heapgap::trace::{AllocTag, Event, Sequence, STAGE_MARKER};
use heapgap::types::{GeneratorPreset, RunConfig};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

fn stub_oracle(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("oracle.sh");
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn config(oracle: PathBuf, time_limit: u64) -> RunConfig {
    RunConfig {
        oracle,
        starting_state: "default".to_string(),
        generator: GeneratorPreset::Pair,
        first_size: 64,
        second_size: 64,
        jobs: 2,
        time_limit: Some(time_limit),
        execution_limit: None,
        cutoff: Some(16),
    }
}

/// Generator that always emits the same two named allocations.
struct FixedGenerator;

impl CandidateGenerator for FixedGenerator {
    fn generate(&mut self) -> Sequence {
        Sequence::new(vec![
            Event::Alloc {
                uid: 1,
                size: 64,
                tag: AllocTag::FirstNamed,
            },
            Event::Alloc {
                uid: 2,
                size: 64,
                tag: AllocTag::SecondNamed,
            },
        ])
    }

    fn first_size(&self) -> u64 {
        64
    }

    fn second_size(&self) -> u64 {
        64
    }
}

/// Generator that dies on first use, standing in for a crashed worker.
struct PanickingGenerator;

impl CandidateGenerator for PanickingGenerator {
    fn generate(&mut self) -> Sequence {
        panic!("worker generator gave out");
    }

    fn first_size(&self) -> u64 {
        64
    }

    fn second_size(&self) -> u64 {
        64
    }
}

fn runner_for(oracle: PathBuf, starting_config: Vec<String>) -> OracleRunner {
    OracleRunner::new(oracle, Materialize::Trace { starting_config })
}

#[test]
fn test_tight_neighbor_is_recorded_as_adjusted_zero() {
    // A raw distance of 64 with a 64-byte second allocation is a gap of 0:
    // the two blocks touch.
    let dir = TempDir::new().unwrap();
    let oracle = stub_oracle(dir.path(), "echo 'vtx distance 64'");
    let out = dir.path().join("run");

    let cfg = config(oracle.clone(), 2);
    let outcome = minimize::run_with(
        &cfg,
        &out,
        runner_for(oracle, Vec::new()),
        || Box::new(FixedGenerator),
    )
    .expect("run should terminate on its time budget");

    assert_eq!(outcome.best_pos, Some(0), "tight neighbor adjusts to zero");
    assert_eq!(outcome.best_neg, None, "the stub never reports a negative side");
    assert!(out.join(POS_TRIGGER_FILE).exists());
    assert!(outcome.total_execs > 0);
}

#[test]
fn test_failing_oracle_only_increments_errors() {
    let dir = TempDir::new().unwrap();
    // Hangs forever; every candidate classifies as a timeout under the short
    // runner deadline.
    let oracle = stub_oracle(dir.path(), "sleep 30");
    let out = dir.path().join("run");

    let cfg = config(oracle.clone(), 2);
    let runner = OracleRunner::with_timeout(
        oracle,
        Materialize::Trace {
            starting_config: Vec::new(),
        },
        Duration::from_millis(100),
    );
    let outcome = minimize::run_with(&cfg, &out, runner, || Box::new(FixedGenerator))
        .expect("budget exhaustion is a normal termination");

    assert_eq!(outcome.best_neg, None);
    assert_eq!(outcome.best_pos, None);
    assert!(!out.join(POS_TRIGGER_FILE).exists());
    assert!(!out.join(NEG_TRIGGER_FILE).exists());
    assert!(
        outcome.total_errors > 0,
        "every candidate should have counted as an error"
    );
    assert_eq!(outcome.total_execs, outcome.total_errors);
}

#[test]
fn test_negative_reproducer_carries_config_and_stage_marker() {
    let dir = TempDir::new().unwrap();
    let oracle = stub_oracle(dir.path(), "echo 'vtx distance -104'");
    let out = dir.path().join("run");
    let starting_config = vec!["vtx alloc 32 32768".to_string()];

    let cfg = config(oracle.clone(), 2);
    let outcome = minimize::run_with(
        &cfg,
        &out,
        runner_for(oracle, starting_config),
        || Box::new(FixedGenerator),
    )
    .unwrap();

    assert_eq!(outcome.best_neg, Some(-40), "-104 + 64 adjusts to -40");

    let trigger = fs::read_to_string(out.join(NEG_TRIGGER_FILE)).unwrap();
    let lines: Vec<&str> = trigger.lines().collect();
    assert_eq!(lines[0], "vtx alloc 32 32768", "starting config leads");
    let src = lines.iter().position(|l| *l == "vtx src 64").unwrap();
    assert_eq!(
        lines[src + 1],
        STAGE_MARKER,
        "stage marker sits directly after the first named allocation"
    );
    assert_eq!(lines[src + 2], "vtx dst 64");
}

#[test]
fn test_cutoff_on_both_sides_ends_the_run_early() {
    let dir = TempDir::new().unwrap();
    // Alternate sides based on input length parity; the random generator
    // varies candidate length, so both sides appear quickly.
    let oracle = stub_oracle(
        dir.path(),
        "if [ $(( $(wc -l < \"$1\") % 2 )) -eq 0 ]; then\n\
         echo 'vtx distance -72'\n\
         else\n\
         echo 'vtx distance 64'\n\
         fi",
    );
    let out = dir.path().join("run");

    // Generous time budget: the run must end on the cutoff, not on time.
    let cfg = config(oracle, 60);
    let start = std::time::Instant::now();
    let outcome = minimize::run(&cfg, &[], &out).unwrap();

    assert!(outcome.solved(cfg.cutoff), "both sides within cutoff 16");
    assert_eq!(outcome.best_neg, Some(-8));
    assert_eq!(outcome.best_pos, Some(0));
    assert!(
        start.elapsed() < Duration::from_secs(30),
        "cutoff termination should beat the time budget"
    );
}

#[test]
fn test_distance_inside_a_block_is_a_protocol_mismatch() {
    // A raw distance of -10 against a 64-byte first allocation would mean
    // the blocks overlap backwards; that is a broken oracle, not a result.
    let dir = TempDir::new().unwrap();
    let oracle = stub_oracle(dir.path(), "echo 'vtx distance -10'");
    let out = dir.path().join("run");

    let cfg = config(oracle.clone(), 10);
    let result = minimize::run_with(
        &cfg,
        &out,
        runner_for(oracle, Vec::new()),
        || Box::new(FixedGenerator),
    );
    assert!(result.is_err(), "the adjustment invariant must hold");
}

#[test]
fn test_dead_worker_aborts_the_run() {
    let dir = TempDir::new().unwrap();
    let oracle = stub_oracle(dir.path(), "echo 'vtx distance 64'");
    let out = dir.path().join("run");

    let cfg = config(oracle.clone(), 30);
    let result = minimize::run_with(
        &cfg,
        &out,
        runner_for(oracle, Vec::new()),
        || Box::new(PanickingGenerator),
    );

    let err = result.expect_err("a crashed worker is fatal to the run");
    assert!(err.to_string().contains("unexpectedly"), "got: {err}");
}

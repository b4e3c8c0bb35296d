// SPDX-License-Identifier: PMPL-1.0-or-later

//! Experiment records and batch management.
//!
//! Every minimization run persists its configuration and outcome as
//! `result.json` in its output directory. A results tree can later be
//! scanned for configurations that missed their cutoff and those re-run
//! without retyping their parameters.

use crate::types::{RunConfig, RunOutcome};
use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use walkdir::WalkDir;

pub const RESULT_FILE: &str = "result.json";

/// Immutable-after-write record of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentRecord {
    pub created_at: String,
    pub config: RunConfig,
    pub outcome: RunOutcome,
}

impl ExperimentRecord {
    pub fn new(config: RunConfig, outcome: RunOutcome) -> Self {
        Self {
            created_at: Utc::now().to_rfc3339(),
            config,
            outcome,
        }
    }

    pub fn solved(&self) -> bool {
        self.outcome.solved(self.config.cutoff)
    }
}

/// Write the record into `dir/result.json`.
pub fn persist(record: &ExperimentRecord, dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(RESULT_FILE);
    let json = serde_json::to_string_pretty(record)?;
    fs::write(&path, json)
        .with_context(|| format!("writing experiment record {}", path.display()))?;
    Ok(path)
}

pub fn load(path: &Path) -> Result<ExperimentRecord> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading experiment record {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("parsing experiment record {}", path.display()))
}

/// Scan a results tree for records whose run did not reach its cutoff.
pub fn unsuccessful(root: &Path) -> Result<Vec<ExperimentRecord>> {
    if !root.is_dir() {
        bail!("not a results directory: {}", root.display());
    }

    let mut records = Vec::new();
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file() && entry.file_name() == RESULT_FILE {
            let record = load(entry.path())?;
            if !record.solved() {
                records.push(record);
            }
        }
    }
    Ok(records)
}

/// Reconstruct the `minimize` argument vector for a recorded configuration.
pub fn minimize_args(config: &RunConfig, output_dir: &Path) -> Vec<String> {
    let mut args = vec![
        "minimize".to_string(),
        "--oracle".to_string(),
        config.oracle.display().to_string(),
        "--first-size".to_string(),
        config.first_size.to_string(),
        "--second-size".to_string(),
        config.second_size.to_string(),
        "--jobs".to_string(),
        config.jobs.to_string(),
        "--starting-state".to_string(),
        config.starting_state.clone(),
        "--generator".to_string(),
        config.generator.label().to_string(),
        "--output-dir".to_string(),
        output_dir.display().to_string(),
    ];
    if let Some(limit) = config.time_limit {
        args.push("--time-limit".to_string());
        args.push(limit.to_string());
    }
    if let Some(limit) = config.execution_limit {
        args.push("--execution-limit".to_string());
        args.push(limit.to_string());
    }
    if let Some(cutoff) = config.cutoff {
        args.push("--cutoff".to_string());
        args.push(cutoff.to_string());
    }
    args
}

/// Re-run one recorded configuration through a fresh process of this
/// executable, writing into `output_parent/<config summary>`.
pub fn rerun(record: &ExperimentRecord, output_parent: &Path) -> Result<()> {
    let config = &record.config;
    let dir_name = format!(
        "{}-{}-{}-{}",
        config.generator, config.first_size, config.second_size, config.jobs
    );
    let output_dir = output_parent.join(dir_name);
    println!("running {}", output_dir.display());

    let exe = std::env::current_exe().context("locating current executable")?;
    let status = Command::new(exe)
        .args(minimize_args(config, &output_dir))
        .status()
        .with_context(|| format!("re-running {config}"))?;

    if !status.success() {
        println!("{} exited with {}", output_dir.display(), status);
    }
    Ok(())
}

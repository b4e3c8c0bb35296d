// SPDX-License-Identifier: PMPL-1.0-or-later

//! Core type definitions for heapgap.
//!
//! Shared configuration and result types used across the search pipeline:
//! generator presets, run configuration, run outcomes, and the per-candidate
//! oracle failure classification.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Classification of a failed oracle invocation.
///
/// These are stochastic per-candidate failures: they are counted by the
/// worker that hit them and the candidate is discarded. They never abort a
/// search loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OracleError {
    /// The oracle process could not be spawned.
    Os,
    /// The oracle exceeded its time budget and was killed.
    Timeout,
    /// Nonzero exit, or no distance report in the output.
    Exec,
    /// The oracle refused to run part of the candidate.
    Security,
}

impl fmt::Display for OracleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OracleError::Os => write!(f, "OS error"),
            OracleError::Timeout => write!(f, "timeout"),
            OracleError::Exec => write!(f, "execution error"),
            OracleError::Security => write!(f, "security refusal"),
        }
    }
}

/// Candidate generator presets selectable from the CLI and from solve plans.
///
/// The preset names encode their shape parameters: `Sl<n>` is the maximum
/// random prefix length, `Afr<n>` the alloc/free ratio in percent, `Guard<n>`
/// the number of guard allocations around the first named allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GeneratorPreset {
    /// Every multiple of 4 in [4, 256] as the allowed size set.
    SynthSmall,
    /// Sizes reachable through a string-duplication primitive.
    StringDup,
    /// Only the two sizes under test.
    Pair,
    /// Pair sizes with a phase schedule that lengthens sequences over time.
    Adaptive,
    PairSl1024Afr55,
    PairSl256Afr98,
    PairSl8192Afr100,
    PairSl1024Afr98,
    Guard1Sl1024Afr98,
    Guard4Sl1024Afr98,
    Guard16Sl1024Afr98,
    HalfGuard4Sl1024Afr98,
}

impl GeneratorPreset {
    pub fn all() -> Vec<Self> {
        vec![
            GeneratorPreset::SynthSmall,
            GeneratorPreset::StringDup,
            GeneratorPreset::Pair,
            GeneratorPreset::Adaptive,
            GeneratorPreset::PairSl1024Afr55,
            GeneratorPreset::PairSl256Afr98,
            GeneratorPreset::PairSl8192Afr100,
            GeneratorPreset::PairSl1024Afr98,
            GeneratorPreset::Guard1Sl1024Afr98,
            GeneratorPreset::Guard4Sl1024Afr98,
            GeneratorPreset::Guard16Sl1024Afr98,
            GeneratorPreset::HalfGuard4Sl1024Afr98,
        ]
    }

    pub fn label(&self) -> &'static str {
        match self {
            GeneratorPreset::SynthSmall => "synth-small",
            GeneratorPreset::StringDup => "string-dup",
            GeneratorPreset::Pair => "pair",
            GeneratorPreset::Adaptive => "adaptive",
            GeneratorPreset::PairSl1024Afr55 => "pair-sl1024-afr55",
            GeneratorPreset::PairSl256Afr98 => "pair-sl256-afr98",
            GeneratorPreset::PairSl8192Afr100 => "pair-sl8192-afr100",
            GeneratorPreset::PairSl1024Afr98 => "pair-sl1024-afr98",
            GeneratorPreset::Guard1Sl1024Afr98 => "guard1-sl1024-afr98",
            GeneratorPreset::Guard4Sl1024Afr98 => "guard4-sl1024-afr98",
            GeneratorPreset::Guard16Sl1024Afr98 => "guard16-sl1024-afr98",
            GeneratorPreset::HalfGuard4Sl1024Afr98 => "half-guard4-sl1024-afr98",
        }
    }
}

impl fmt::Display for GeneratorPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Configuration for one minimization run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// The oracle executable that replays a sequence file.
    pub oracle: PathBuf,
    /// Starting-state label: "default", "random", or a trace file path.
    pub starting_state: String,
    pub generator: GeneratorPreset,
    /// Size of the first named allocation.
    pub first_size: u64,
    /// Size of the second named allocation.
    pub second_size: u64,
    /// Number of search workers.
    pub jobs: usize,
    /// Wall-clock budget in seconds.
    pub time_limit: Option<u64>,
    /// Total successful-execution budget.
    pub execution_limit: Option<u64>,
    /// Maximum acceptable absolute adjusted distance on each side.
    pub cutoff: Option<i64>,
}

impl fmt::Display for RunConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "oracle={} start={} generator={} first={} second={} jobs={} cutoff={:?}",
            self.oracle.display(),
            self.starting_state,
            self.generator,
            self.first_size,
            self.second_size,
            self.jobs,
            self.cutoff
        )
    }
}

/// Outcome of one minimization run. Written once at run end, never mutated
/// afterwards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunOutcome {
    /// Best adjusted negative-side distance (first block before second).
    pub best_neg: Option<i64>,
    /// Best adjusted positive-side distance (first block after second).
    pub best_pos: Option<i64>,
    pub execs_to_neg: u64,
    pub execs_to_pos: u64,
    pub secs_to_neg: f64,
    pub secs_to_pos: f64,
    pub total_secs: f64,
    pub total_execs: u64,
    pub total_errors: u64,
}

impl RunOutcome {
    pub fn record_neg(&mut self, dist: i64, secs: f64, execs: u64) {
        self.best_neg = Some(dist);
        self.secs_to_neg = secs;
        self.execs_to_neg = execs;
    }

    pub fn record_pos(&mut self, dist: i64, secs: f64, execs: u64) {
        self.best_pos = Some(dist);
        self.secs_to_pos = secs;
        self.execs_to_pos = execs;
    }

    /// Whether both sides reached the cutoff. A run without a cutoff is
    /// never considered solved.
    pub fn solved(&self, cutoff: Option<i64>) -> bool {
        match (cutoff, self.best_neg, self.best_pos) {
            (Some(c), Some(neg), Some(pos)) => neg.abs() <= c && pos <= c,
            _ => false,
        }
    }
}

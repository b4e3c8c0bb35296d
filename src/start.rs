// SPDX-License-Identifier: PMPL-1.0-or-later

//! Starting allocator configurations.
//!
//! A starting configuration is a uid-form event list that brings the
//! allocator into a known state before the candidate sequence runs. It can
//! be empty, randomly generated, or derived from a recorded address-form
//! trace of a real program's startup.

use crate::trace::{self, AllocTag, Event, Sequence};
use anyhow::{Context, Result};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::fs;
use std::path::{Path, PathBuf};

/// First uid issued to starting-configuration allocations. High enough that
/// candidate uids (which start at 3) can never collide with it.
pub const STARTING_UID_BASE: u64 = 32768;

const RANDOM_MIN_EVENTS: usize = 64;
const RANDOM_MAX_EVENTS: usize = 512;
const RANDOM_MIN_SIZE: u64 = 8;
const RANDOM_MAX_SIZE: u64 = 4096;
const RANDOM_ALLOC_RATIO: f64 = 0.65;

/// Starting-state selector, parsed from a CLI label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartingState {
    /// No warm-up events.
    Default,
    /// A random alloc/free prefix.
    Random,
    /// Derived from a recorded allocator trace file.
    Trace(PathBuf),
}

impl StartingState {
    /// `"default"` and `"random"` are keywords; anything else is a trace
    /// file path.
    pub fn parse(label: &str) -> Self {
        match label {
            "default" => StartingState::Default,
            "random" => StartingState::Random,
            path => StartingState::Trace(PathBuf::from(path)),
        }
    }

    pub fn label(&self) -> String {
        match self {
            StartingState::Default => "default".to_string(),
            StartingState::Random => "random".to_string(),
            StartingState::Trace(path) => path.display().to_string(),
        }
    }

    /// Materialize the configuration as uid-form protocol lines.
    pub fn build(&self) -> Result<Vec<String>> {
        match self {
            StartingState::Default => Ok(Vec::new()),
            StartingState::Random => Ok(random_start(ChaCha8Rng::from_entropy())),
            StartingState::Trace(path) => from_trace_file(path),
        }
    }
}

fn random_start(mut rng: ChaCha8Rng) -> Vec<String> {
    let mut events = Vec::new();
    let mut next_uid = STARTING_UID_BASE;
    let mut live: Vec<u64> = Vec::new();

    for _ in 0..rng.gen_range(RANDOM_MIN_EVENTS..=RANDOM_MAX_EVENTS) {
        if live.is_empty() || rng.gen::<f64>() <= RANDOM_ALLOC_RATIO {
            let size = rng.gen_range(RANDOM_MIN_SIZE..=RANDOM_MAX_SIZE);
            events.push(Event::Alloc {
                uid: next_uid,
                size,
                tag: AllocTag::Normal,
            });
            live.push(next_uid);
            next_uid += 1;
        } else {
            let idx = rng.gen_range(0..live.len());
            events.push(Event::Free {
                uid: live.swap_remove(idx),
            });
        }
    }

    Sequence::new(events).stringify()
}

/// Derive a starting configuration from a recorded address-form trace,
/// reassigning fresh uids. Strict: a trace that frees or reallocs an
/// address it never allocated does not describe a reachable allocator
/// state.
pub fn from_trace_file(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading starting-config trace {}", path.display()))?;
    let lines: Vec<&str> = content.lines().collect();
    let sequence = trace::parse_trace_strict(&lines, STARTING_UID_BASE)
        .with_context(|| format!("parsing starting-config trace {}", path.display()))?;
    Ok(sequence.stringify())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_round_trip() {
        for label in ["default", "random", "/tmp/boot-trace.txt"] {
            assert_eq!(StartingState::parse(label).label(), label);
        }
    }

    #[test]
    fn test_default_state_is_empty() {
        assert!(StartingState::Default.build().unwrap().is_empty());
    }

    #[test]
    fn test_random_state_is_parseable_and_self_contained() {
        let lines = StartingState::Random.build().unwrap();
        assert!(lines.len() >= RANDOM_MIN_EVENTS);
        let seq = trace::parse(&lines).expect("random start must be valid uid-form");
        let summary = crate::fragments::Summary::of(&seq);
        assert!(summary.self_contained);
    }

    #[test]
    fn test_trace_state_reassigns_uids() {
        let dir = tempfile::tempdir().unwrap();
        let trace_path = dir.path().join("boot.txt");
        fs::write(
            &trace_path,
            "vtx alloc 32 0x1000\nvtx free 0x1000\n",
        )
        .unwrap();

        let lines = from_trace_file(&trace_path).unwrap();
        assert_eq!(
            lines,
            vec![
                format!("vtx alloc 32 {}", STARTING_UID_BASE),
                format!("vtx free {}", STARTING_UID_BASE),
            ]
        );
    }

    #[test]
    fn test_trace_state_rejects_foreign_frees() {
        let dir = tempfile::tempdir().unwrap();
        let trace_path = dir.path().join("boot.txt");
        fs::write(&trace_path, "vtx free 0xdead\n").unwrap();
        assert!(from_trace_file(&trace_path).is_err());
    }
}

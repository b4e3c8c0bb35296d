// SPDX-License-Identifier: PMPL-1.0-or-later

//! Time-adaptive generator wrapper.
//!
//! Wraps a base generator and walks a fixed phase schedule over the run's
//! wall-clock budget: short, noisy sequences early to explore, long
//! low-noise sequences late to converge. The active phase is re-derived on
//! every `generate()` call by comparing elapsed time against cumulative
//! phase thresholds.

use super::{CandidateGenerator, SynthGenerator};
use crate::trace::Sequence;
use std::time::{Duration, Instant};

/// (fraction of total budget, max prefix length, alloc/free ratio)
const SCHEDULE: [(f64, usize, f64); 4] = [
    (0.05, 32, 0.60),
    (0.15, 64, 0.75),
    (0.70, 1024, 0.98),
    (0.10, 4096, 0.996),
];

#[derive(Debug, Clone, Copy)]
struct Phase {
    starts_at: Duration,
    max_seq_len: usize,
    alloc_free_ratio: f64,
}

pub struct AdaptiveGenerator {
    inner: SynthGenerator,
    phases: Vec<Phase>,
    started: Option<Instant>,
    next_phase: usize,
}

impl AdaptiveGenerator {
    pub fn new(inner: SynthGenerator, total_time: Duration) -> Self {
        let mut phases = Vec::with_capacity(SCHEDULE.len());
        let mut elapsed_fraction = 0.0;
        for (fraction, max_seq_len, alloc_free_ratio) in SCHEDULE {
            phases.push(Phase {
                starts_at: total_time.mul_f64(elapsed_fraction),
                max_seq_len,
                alloc_free_ratio,
            });
            elapsed_fraction += fraction;
        }

        Self {
            inner,
            phases,
            started: None,
            next_phase: 0,
        }
    }

    /// The shape currently applied to the wrapped generator.
    pub fn current_shape(&self) -> (usize, f64) {
        let params = self.inner.shape();
        (params.max_seq_len, params.alloc_free_ratio)
    }

    fn advance_phase(&mut self) {
        let started = *self.started.get_or_insert_with(Instant::now);
        while self.next_phase < self.phases.len() {
            let phase = self.phases[self.next_phase];
            if started.elapsed() < phase.starts_at {
                break;
            }
            self.inner.set_shape(phase.max_seq_len, phase.alloc_free_ratio);
            println!(
                "updating generator parameters: max_seq_len: {}, alloc_free_ratio: {}",
                phase.max_seq_len, phase.alloc_free_ratio
            );
            self.next_phase += 1;
        }
    }
}

impl CandidateGenerator for AdaptiveGenerator {
    fn generate(&mut self) -> Sequence {
        self.advance_phase();
        self.inner.generate()
    }

    fn first_size(&self) -> u64 {
        self.inner.first_size()
    }

    fn second_size(&self) -> u64 {
        self.inner.second_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate::ShapeParams;
    use std::thread;

    fn base() -> SynthGenerator {
        SynthGenerator::seeded(64, 64, vec![64], ShapeParams::default(), 1)
    }

    #[test]
    fn test_first_generate_applies_the_opening_phase() {
        let mut gen = AdaptiveGenerator::new(base(), Duration::from_secs(3600));
        gen.generate();
        assert_eq!(gen.current_shape(), (32, 0.60));
    }

    #[test]
    fn test_phases_advance_with_elapsed_time() {
        // 40ms budget: phase thresholds land at 0/2/8/36 ms.
        let mut gen = AdaptiveGenerator::new(base(), Duration::from_millis(40));
        gen.generate();
        thread::sleep(Duration::from_millis(50));
        gen.generate();
        assert_eq!(gen.current_shape(), (4096, 0.996), "past the budget, the final phase holds");
    }
}

// SPDX-License-Identifier: PMPL-1.0-or-later

//! Candidate sequence generators.
//!
//! Every generator produces sequences containing exactly one first-named and
//! one second-named allocation, surrounded by a random prefix of alloc/free
//! noise, optional guard allocations pinning the first named allocation's
//! neighbors, and an optional noise run between the two named allocations.
//! Concrete variants differ only in their allowed-size sets and shape
//! parameters.

mod adaptive;

pub use adaptive::AdaptiveGenerator;

use crate::trace::{AllocTag, Event, Sequence, FIRST_NAMED_UID, SECOND_NAMED_UID};
use crate::types::GeneratorPreset;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::time::Duration;

/// First uid handed to prefix/guard/noise allocations; 1 and 2 are reserved
/// for the named allocations.
const FIRST_SYNTH_UID: u64 = 3;

/// A strategy that synthesizes candidate interaction sequences.
pub trait CandidateGenerator: Send {
    fn generate(&mut self) -> Sequence;

    /// Size of the first named allocation.
    fn first_size(&self) -> u64;

    /// Size of the second named allocation.
    fn second_size(&self) -> u64;
}

/// Shape parameters shared by the whole generator family.
#[derive(Debug, Clone)]
pub struct ShapeParams {
    /// Bounds on the random alloc/free prefix length.
    pub min_seq_len: usize,
    pub max_seq_len: usize,
    /// Bounds on the noise run between the two named allocations.
    pub min_intervening_len: usize,
    pub max_intervening_len: usize,
    /// Probability of choosing an allocation over a free at each noise step.
    /// A free is only possible while something is live.
    pub alloc_free_ratio: f64,
    /// Guard allocations placed before and after the first named allocation.
    pub guard_count: usize,
    /// Guard allocation size; defaults to the second named size.
    pub guard_size: Option<u64>,
}

impl Default for ShapeParams {
    fn default() -> Self {
        Self {
            min_seq_len: 0,
            max_seq_len: 256,
            min_intervening_len: 0,
            max_intervening_len: 16,
            alloc_free_ratio: 0.55,
            guard_count: 0,
            guard_size: None,
        }
    }
}

impl ShapeParams {
    fn with_shape(max_seq_len: usize, alloc_free_ratio: f64) -> Self {
        Self {
            max_seq_len,
            alloc_free_ratio,
            ..Self::default()
        }
    }

    fn with_guards(max_seq_len: usize, alloc_free_ratio: f64, guard_count: usize) -> Self {
        Self {
            guard_count,
            ..Self::with_shape(max_seq_len, alloc_free_ratio)
        }
    }
}

/// The one concrete generator: random prefix + guarded first named
/// allocation + optional intervening noise + second named allocation, over a
/// fixed allowed-size set.
pub struct SynthGenerator {
    first_size: u64,
    second_size: u64,
    params: ShapeParams,
    sizes: Vec<u64>,
    rng: ChaCha8Rng,
    next_uid: u64,
    live: Vec<u64>,
}

impl SynthGenerator {
    pub fn new(first_size: u64, second_size: u64, sizes: Vec<u64>, params: ShapeParams) -> Self {
        Self::with_rng(first_size, second_size, sizes, params, ChaCha8Rng::from_entropy())
    }

    /// Deterministic construction for tests.
    pub fn seeded(
        first_size: u64,
        second_size: u64,
        sizes: Vec<u64>,
        params: ShapeParams,
        seed: u64,
    ) -> Self {
        Self::with_rng(
            first_size,
            second_size,
            sizes,
            params,
            ChaCha8Rng::seed_from_u64(seed),
        )
    }

    fn with_rng(
        first_size: u64,
        second_size: u64,
        sizes: Vec<u64>,
        params: ShapeParams,
        rng: ChaCha8Rng,
    ) -> Self {
        assert!(!sizes.is_empty(), "generator needs a non-empty size set");
        Self {
            first_size,
            second_size,
            params,
            sizes,
            rng,
            next_uid: FIRST_SYNTH_UID,
            live: Vec::new(),
        }
    }

    pub fn shape(&self) -> &ShapeParams {
        &self.params
    }

    /// Used by the adaptive wrapper to move between phases.
    pub fn set_shape(&mut self, max_seq_len: usize, alloc_free_ratio: f64) {
        self.params.max_seq_len = max_seq_len;
        self.params.alloc_free_ratio = alloc_free_ratio;
    }

    fn take_uid(&mut self) -> u64 {
        let uid = self.next_uid;
        self.next_uid += 1;
        uid
    }

    fn guard_size(&self) -> u64 {
        self.params.guard_size.unwrap_or(self.second_size)
    }

    fn push_noise(&mut self, out: &mut Vec<Event>, count: usize) {
        for _ in 0..count {
            if self.live.is_empty() || self.rng.gen::<f64>() <= self.params.alloc_free_ratio {
                let size = *self.sizes.choose(&mut self.rng).expect("size set is non-empty");
                let uid = self.take_uid();
                self.live.push(uid);
                out.push(Event::Alloc {
                    uid,
                    size,
                    tag: AllocTag::Normal,
                });
            } else {
                let idx = self.rng.gen_range(0..self.live.len());
                let uid = self.live.swap_remove(idx);
                out.push(Event::Free { uid });
            }
        }
    }

    fn push_guard(&mut self, out: &mut Vec<Event>) {
        // Guards never enter the live set: they must not be freeable by the
        // noise steps, or they would stop pinning the neighbor slots.
        let uid = self.take_uid();
        out.push(Event::Alloc {
            uid,
            size: self.guard_size(),
            tag: AllocTag::Normal,
        });
    }
}

impl CandidateGenerator for SynthGenerator {
    fn generate(&mut self) -> Sequence {
        self.next_uid = FIRST_SYNTH_UID;
        self.live.clear();

        let mut events = Vec::new();
        let prefix_len = self
            .rng
            .gen_range(self.params.min_seq_len..=self.params.max_seq_len);
        self.push_noise(&mut events, prefix_len);

        for _ in 0..self.params.guard_count {
            self.push_guard(&mut events);
        }
        events.push(Event::Alloc {
            uid: FIRST_NAMED_UID,
            size: self.first_size,
            tag: AllocTag::FirstNamed,
        });
        for _ in 0..self.params.guard_count {
            self.push_guard(&mut events);
        }

        if self.rng.gen_bool(0.5) {
            let intervening = self
                .rng
                .gen_range(self.params.min_intervening_len..=self.params.max_intervening_len);
            self.push_noise(&mut events, intervening);
        }

        events.push(Event::Alloc {
            uid: SECOND_NAMED_UID,
            size: self.second_size,
            tag: AllocTag::SecondNamed,
        });

        Sequence::new(events)
    }

    fn first_size(&self) -> u64 {
        self.first_size
    }

    fn second_size(&self) -> u64 {
        self.second_size
    }
}

/// Every multiple of 4 in [4, 256].
pub fn small_uniform_sizes() -> Vec<u64> {
    (1..=64).map(|i| i * 4).collect()
}

/// Sizes reachable through a string-duplication primitive: a dense band of
/// small sizes, page-granular mid sizes, and two large outliers.
pub fn string_dup_sizes() -> Vec<u64> {
    let mut sizes = vec![33];
    sizes.extend((16..=2016).step_by(16));
    sizes.extend((4064..=131_040).step_by(4096));
    sizes.push(262_112);
    sizes.push(4_194_272);
    sizes
}

impl GeneratorPreset {
    /// Instantiate the preset for a size pair. `time_limit` feeds the
    /// adaptive preset's phase schedule and is ignored by the others.
    pub fn build(
        &self,
        first_size: u64,
        second_size: u64,
        time_limit: Option<Duration>,
    ) -> Box<dyn CandidateGenerator> {
        let pair = vec![first_size, second_size];
        match self {
            GeneratorPreset::SynthSmall => Box::new(SynthGenerator::new(
                first_size,
                second_size,
                small_uniform_sizes(),
                ShapeParams::default(),
            )),
            GeneratorPreset::StringDup => Box::new(SynthGenerator::new(
                first_size,
                second_size,
                string_dup_sizes(),
                ShapeParams::default(),
            )),
            GeneratorPreset::Pair => Box::new(SynthGenerator::new(
                first_size,
                second_size,
                pair,
                ShapeParams::default(),
            )),
            GeneratorPreset::Adaptive => {
                let base =
                    SynthGenerator::new(first_size, second_size, pair, ShapeParams::default());
                Box::new(AdaptiveGenerator::new(
                    base,
                    time_limit.unwrap_or(Duration::from_secs(3600)),
                ))
            }
            GeneratorPreset::PairSl1024Afr55 => Box::new(SynthGenerator::new(
                first_size,
                second_size,
                pair,
                ShapeParams::with_shape(1024, 0.55),
            )),
            GeneratorPreset::PairSl256Afr98 => Box::new(SynthGenerator::new(
                first_size,
                second_size,
                pair,
                ShapeParams::with_shape(256, 0.98),
            )),
            GeneratorPreset::PairSl8192Afr100 => Box::new(SynthGenerator::new(
                first_size,
                second_size,
                pair,
                ShapeParams::with_shape(8192, 1.0),
            )),
            GeneratorPreset::PairSl1024Afr98 => Box::new(SynthGenerator::new(
                first_size,
                second_size,
                pair,
                ShapeParams::with_shape(1024, 0.98),
            )),
            GeneratorPreset::Guard1Sl1024Afr98 => Box::new(SynthGenerator::new(
                first_size,
                second_size,
                pair,
                ShapeParams::with_guards(1024, 0.98, 1),
            )),
            GeneratorPreset::Guard4Sl1024Afr98 => Box::new(SynthGenerator::new(
                first_size,
                second_size,
                pair,
                ShapeParams::with_guards(1024, 0.98, 4),
            )),
            GeneratorPreset::Guard16Sl1024Afr98 => Box::new(SynthGenerator::new(
                first_size,
                second_size,
                pair,
                ShapeParams::with_guards(1024, 0.98, 16),
            )),
            GeneratorPreset::HalfGuard4Sl1024Afr98 => {
                let params = ShapeParams {
                    guard_size: Some(second_size / 2),
                    ..ShapeParams::with_guards(1024, 0.98, 4)
                };
                Box::new(SynthGenerator::new(first_size, second_size, pair, params))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::AllocTag;

    fn named_count(seq: &Sequence, tag: AllocTag) -> usize {
        seq.events()
            .iter()
            .filter(|e| matches!(e, Event::Alloc { tag: t, .. } if *t == tag))
            .count()
    }

    #[test]
    fn test_generate_has_exactly_one_of_each_named_alloc() {
        let mut gen = SynthGenerator::seeded(
            64,
            128,
            small_uniform_sizes(),
            ShapeParams::default(),
            1,
        );
        for _ in 0..50 {
            let seq = gen.generate();
            assert_eq!(named_count(&seq, AllocTag::FirstNamed), 1);
            assert_eq!(named_count(&seq, AllocTag::SecondNamed), 1);
        }
    }

    #[test]
    fn test_first_named_comes_before_second_named() {
        let mut gen =
            SynthGenerator::seeded(32, 32, vec![32], ShapeParams::default(), 2);
        let seq = gen.generate();
        let first = seq
            .events()
            .iter()
            .position(|e| matches!(e, Event::Alloc { tag: AllocTag::FirstNamed, .. }))
            .unwrap();
        let second = seq
            .events()
            .iter()
            .position(|e| matches!(e, Event::Alloc { tag: AllocTag::SecondNamed, .. }))
            .unwrap();
        assert!(first < second);
    }

    #[test]
    fn test_guards_flank_the_first_named_alloc() {
        let params = ShapeParams {
            min_seq_len: 0,
            max_seq_len: 0,
            min_intervening_len: 0,
            max_intervening_len: 0,
            guard_count: 4,
            ..ShapeParams::default()
        };
        let mut gen = SynthGenerator::seeded(64, 128, vec![64, 128], params, 3);
        let seq = gen.generate();
        let first = seq
            .events()
            .iter()
            .position(|e| matches!(e, Event::Alloc { tag: AllocTag::FirstNamed, .. }))
            .unwrap();
        assert_eq!(first, 4, "four guards precede the first named alloc");

        let guard_sizes: Vec<u64> = seq.events()[..4]
            .iter()
            .map(|e| match e {
                Event::Alloc { size, .. } => *size,
                other => panic!("guard position holds {other:?}"),
            })
            .collect();
        assert_eq!(guard_sizes, vec![128; 4], "guard size defaults to the second size");

        // four guards follow it too
        for event in &seq.events()[first + 1..first + 5] {
            assert!(matches!(
                event,
                Event::Alloc {
                    tag: AllocTag::Normal,
                    size: 128,
                    ..
                }
            ));
        }
    }

    #[test]
    fn test_ratio_one_never_frees() {
        let params = ShapeParams {
            min_seq_len: 64,
            max_seq_len: 64,
            alloc_free_ratio: 1.0,
            ..ShapeParams::default()
        };
        let mut gen = SynthGenerator::seeded(16, 16, vec![16], params, 4);
        let seq = gen.generate();
        assert!(seq
            .events()
            .iter()
            .all(|e| !matches!(e, Event::Free { .. })));
    }

    #[test]
    fn test_noise_sizes_come_from_the_allowed_set() {
        let params = ShapeParams {
            min_seq_len: 32,
            max_seq_len: 32,
            ..ShapeParams::default()
        };
        let mut gen = SynthGenerator::seeded(24, 40, vec![48, 56], params, 5);
        let seq = gen.generate();
        for event in seq.events() {
            if let Event::Alloc {
                tag: AllocTag::Normal,
                size,
                ..
            } = event
            {
                assert!([48, 56].contains(size), "unexpected noise size {size}");
            }
        }
    }

    #[test]
    fn test_frees_only_reference_live_allocations() {
        let params = ShapeParams {
            min_seq_len: 200,
            max_seq_len: 200,
            alloc_free_ratio: 0.5,
            ..ShapeParams::default()
        };
        let mut gen = SynthGenerator::seeded(16, 16, vec![16], params, 6);
        let seq = gen.generate();
        let summary = crate::fragments::Summary::of(&seq);
        assert!(summary.self_contained);
    }

    #[test]
    fn test_string_dup_size_set_bounds() {
        let sizes = string_dup_sizes();
        assert!(sizes.contains(&33));
        assert!(sizes.contains(&16));
        assert!(sizes.contains(&2016));
        assert!(sizes.contains(&262_112));
        assert!(sizes.contains(&4_194_272));
    }

    #[test]
    fn test_preset_builds_for_every_variant() {
        for preset in GeneratorPreset::all() {
            let mut gen = preset.build(64, 64, Some(Duration::from_secs(60)));
            let seq = gen.generate();
            assert_eq!(named_count(&seq, AllocTag::FirstNamed), 1);
            assert_eq!(named_count(&seq, AllocTag::SecondNamed), 1);
        }
    }
}

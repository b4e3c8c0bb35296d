// SPDX-License-Identifier: PMPL-1.0-or-later

//! Sequence summaries and the size-indexed fragment store.
//!
//! A fragment is an opaque code snippet whose allocator interaction sequence
//! has been measured once; the store indexes fragments by the allocation
//! size classes their sequences touch, so heap-shaping code can be assembled
//! from known building blocks.

use crate::trace::{Event, Sequence};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Round an allocation size up to its 8-byte class.
pub fn size_class(v: u64) -> u64 {
    (v + 7) & !7
}

/// Derived fingerprint of an interaction sequence. Computed once from a
/// finalized sequence, then persisted and reused; never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Summary {
    /// Stable sequence identity (see [`Sequence::id`]).
    pub id: String,
    pub len: usize,
    /// 8-byte-rounded allocation size classes present in the sequence.
    pub size_classes: BTreeSet<u64>,
    pub has_frees: bool,
    pub has_reallocs: bool,
    /// False when any free/realloc referenced a uid the sequence does not
    /// own.
    pub self_contained: bool,
    /// True when any allocation remains unfreed at the end of the sequence.
    pub leaks_memory: bool,
}

impl Summary {
    /// Single pass over the events with a live-uid set.
    pub fn of(sequence: &Sequence) -> Self {
        let mut size_classes = BTreeSet::new();
        let mut live: HashSet<u64> = HashSet::new();
        let mut has_frees = false;
        let mut has_reallocs = false;
        let mut self_contained = true;

        for event in sequence {
            match *event {
                Event::Alloc { uid, size, .. } => {
                    size_classes.insert(size_class(size));
                    live.insert(uid);
                }
                Event::Calloc {
                    uid,
                    count,
                    elem_size,
                } => {
                    size_classes.insert(size_class(count.saturating_mul(elem_size)));
                    live.insert(uid);
                }
                Event::Free { uid } => {
                    has_frees = true;
                    if !live.remove(&uid) {
                        self_contained = false;
                    }
                }
                Event::Realloc {
                    old_uid, new_uid, ..
                } => {
                    has_reallocs = true;
                    if old_uid != 0 && !live.remove(&old_uid) {
                        self_contained = false;
                    }
                    live.insert(new_uid);
                }
            }
        }

        Summary {
            id: sequence.id(),
            len: sequence.len(),
            size_classes,
            has_frees,
            has_reallocs,
            self_contained,
            leaks_memory: !live.is_empty(),
        }
    }
}

struct Indexes {
    /// size class → fragments sorted by sequence length ascending,
    /// non-self-contained fragments excluded.
    by_size: HashMap<u64, Vec<(String, Summary)>>,
    /// size class → all fragments tied for the minimum length. A set, not a
    /// single pick, so random sampling keeps path diversity.
    shortest: HashMap<u64, Vec<(String, Summary)>>,
}

/// In-memory index over one or more persisted fragment stores.
pub struct FragmentStore {
    store: HashMap<String, Summary>,
    indexes: OnceLock<Indexes>,
}

impl FragmentStore {
    /// Load and merge the given store files. On a fragment key collision the
    /// last-loaded store wins.
    pub fn load(paths: &[PathBuf]) -> Result<Self> {
        let mut store = HashMap::new();
        for path in paths {
            let content = fs::read_to_string(path)
                .with_context(|| format!("reading fragment store {}", path.display()))?;
            let data: HashMap<String, Summary> = serde_json::from_str(&content)
                .with_context(|| format!("parsing fragment store {}", path.display()))?;
            store.extend(data);
        }

        Ok(Self {
            store,
            indexes: OnceLock::new(),
        })
    }

    pub fn from_map(store: HashMap<String, Summary>) -> Self {
        Self {
            store,
            indexes: OnceLock::new(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.store)?;
        fs::write(path, json)
            .with_context(|| format!("writing fragment store {}", path.display()))?;
        Ok(())
    }

    pub fn num_fragments(&self) -> usize {
        self.store.len()
    }

    /// Number of distinct interaction sequences across all fragments.
    pub fn num_sequences(&self) -> usize {
        self.store
            .values()
            .map(|summary| summary.id.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    /// Fragments whose sequences allocate the given size class, sorted by
    /// sequence length ascending. `None` when no fragment covers the size.
    pub fn fragments_for_size(&self, size: u64) -> Option<&[(String, Summary)]> {
        self.indexes().by_size.get(&size).map(Vec::as_slice)
    }

    /// All fragments tied for the shortest sequence at the given size class.
    pub fn shortest_fragments_for_size(&self, size: u64) -> Option<&[(String, Summary)]> {
        self.indexes().shortest.get(&size).map(Vec::as_slice)
    }

    fn indexes(&self) -> &Indexes {
        self.indexes.get_or_init(|| self.build_indexes())
    }

    fn build_indexes(&self) -> Indexes {
        let mut by_size: HashMap<u64, Vec<(String, Summary)>> = HashMap::new();
        for (fragment, summary) in &self.store {
            if !summary.self_contained {
                continue;
            }
            for &size in &summary.size_classes {
                by_size
                    .entry(size)
                    .or_default()
                    .push((fragment.clone(), summary.clone()));
            }
        }

        for entries in by_size.values_mut() {
            entries.sort_by(|a, b| a.1.len.cmp(&b.1.len).then_with(|| a.0.cmp(&b.0)));
        }

        let shortest = by_size
            .iter()
            .map(|(&size, entries)| {
                let min_len = entries[0].1.len;
                let ties: Vec<_> = entries
                    .iter()
                    .take_while(|(_, summary)| summary.len == min_len)
                    .cloned()
                    .collect();
                (size, ties)
            })
            .collect();

        Indexes { by_size, shortest }
    }
}

// SPDX-License-Identifier: PMPL-1.0-or-later

//! heapgap — black-box search for heap layout primitives.
//!
//! Treats an allocator, reached through an external replay oracle, as an
//! opaque function from interaction sequences to address distances, and
//! searches for sequences that place two named allocations at a target
//! relative distance (including tight adjacency and overlap).
//!
//! ENGINE PILLARS:
//! 1. **Trace**: the typed interaction model and its `vtx` wire protocol.
//! 2. **Generate**: a family of randomized candidate-sequence generators.
//! 3. **Minimize**: the parallel coordinator that drives worker pools
//!    toward the smallest distances on both sides of the target.
//! 4. **Fragments**: a size-class index over code snippets with measured
//!    interaction sequences, for assembling heap-shaping programs.

pub mod experiments;
pub mod fragments;
pub mod generate;
pub mod minimize;
pub mod oracle;
pub mod solve;
pub mod start;
pub mod trace;
pub mod types;

// SPDX-License-Identifier: PMPL-1.0-or-later

//! Staged multi-distance solving.
//!
//! A solve plan lists distance constraints to satisfy one after another.
//! Each stage runs a full minimization; its reproducer, split at the stage
//! marker, becomes the materialization for the next stage, so later stages
//! manipulate the heap at the point the earlier stages left open.

use crate::fragments::{size_class, FragmentStore};
use crate::minimize::{self, NEG_TRIGGER_FILE, POS_TRIGGER_FILE};
use crate::oracle::{Materialize, OracleRunner};
use crate::trace::STAGE_MARKER;
use crate::types::{GeneratorPreset, RunConfig};
use anyhow::{anyhow, bail, Context, Result};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which side of the search a stage needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Neg,
    #[default]
    Pos,
}

#[derive(Debug, Clone)]
pub struct Stage {
    pub name: String,
    pub first_size: u64,
    pub second_size: u64,
    pub cutoff: i64,
    pub generator: GeneratorPreset,
    pub side: Side,
    pub time_limit: Option<u64>,
    pub execution_limit: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct SolvePlan {
    pub stages: Vec<Stage>,
}

#[derive(Debug, Clone, Deserialize)]
struct PlanSpec {
    stages: Vec<StageSpec>,
}

#[derive(Debug, Clone, Deserialize)]
struct StageSpec {
    name: Option<String>,
    first_size: u64,
    second_size: u64,
    cutoff: i64,
    generator: Option<GeneratorPreset>,
    #[serde(default)]
    side: Side,
    time_limit: Option<u64>,
    execution_limit: Option<u64>,
}

/// Load a plan from YAML or JSON, dispatching on the file extension.
pub fn load_plan(path: &Path) -> Result<SolvePlan> {
    let content =
        fs::read_to_string(path).with_context(|| format!("reading solve plan {}", path.display()))?;
    let ext = path.extension().and_then(|s| s.to_str());
    let spec: PlanSpec = if ext == Some("yaml") || ext == Some("yml") {
        serde_yaml::from_str(&content)
            .with_context(|| format!("parsing yaml solve plan {}", path.display()))?
    } else {
        serde_json::from_str(&content)
            .with_context(|| format!("parsing json solve plan {}", path.display()))?
    };

    if spec.stages.is_empty() {
        bail!("solve plan {} has no stages", path.display());
    }

    let stages = spec
        .stages
        .into_iter()
        .enumerate()
        .map(|(index, stage)| Stage {
            name: stage.name.unwrap_or_else(|| format!("stage-{}", index + 1)),
            first_size: stage.first_size,
            second_size: stage.second_size,
            cutoff: stage.cutoff,
            generator: stage.generator.unwrap_or(GeneratorPreset::Adaptive),
            side: stage.side,
            time_limit: stage.time_limit,
            execution_limit: stage.execution_limit,
        })
        .collect();

    Ok(SolvePlan { stages })
}

/// Verify that the fragment store can shape the heap for every size a plan
/// touches, and log what is available.
pub fn check_store(plan: &SolvePlan, store: &FragmentStore) -> Result<()> {
    for stage in &plan.stages {
        for size in [stage.first_size, stage.second_size] {
            let class = size_class(size);
            let fragments = store
                .fragments_for_size(class)
                .ok_or_else(|| anyhow!("no allocation sequence for size {size} (class {class})"))?;
            println!("{} allocation sequences for size {}", fragments.len(), size);

            let shortest = store
                .shortest_fragments_for_size(class)
                .expect("a populated size class has shortest entries");
            println!(
                "shortest sequences for size {} have length {} ({} alternates)",
                size,
                shortest[0].1.len,
                shortest.len()
            );
        }
    }
    Ok(())
}

/// Run the plan's stages in order. Aborts with the failing stage's
/// configuration when a stage misses its cutoff.
pub fn run(
    plan: &SolvePlan,
    oracle: &Path,
    starting_config: Vec<String>,
    output_root: &Path,
    jobs: usize,
) -> Result<()> {
    fs::create_dir_all(output_root)?;

    let mut materialize = Materialize::Trace { starting_config };
    for (index, stage) in plan.stages.iter().enumerate() {
        println!(
            "{} {} (first={}, second={}, cutoff={})",
            "solving stage".cyan(),
            stage.name,
            stage.first_size,
            stage.second_size,
            stage.cutoff
        );

        let config = RunConfig {
            oracle: oracle.to_path_buf(),
            starting_state: "staged".to_string(),
            generator: stage.generator,
            first_size: stage.first_size,
            second_size: stage.second_size,
            jobs,
            time_limit: stage.time_limit,
            execution_limit: stage.execution_limit,
            cutoff: Some(stage.cutoff),
        };

        let stage_dir = output_root.join(format!("stage-{:02}-{}", index + 1, stage.name));
        let runner = OracleRunner::new(oracle.to_path_buf(), materialize.clone());
        let preset = stage.generator;
        let (first, second) = (stage.first_size, stage.second_size);
        let time_limit = stage.time_limit.map(Duration::from_secs);
        let outcome = minimize::run_with(&config, &stage_dir, runner, move || {
            preset.build(first, second, time_limit)
        })?;

        if !outcome.solved(config.cutoff) {
            bail!("failed to solve stage {} ({config})", stage.name);
        }

        let trigger = stage_dir.join(match stage.side {
            Side::Neg => NEG_TRIGGER_FILE,
            Side::Pos => POS_TRIGGER_FILE,
        });
        materialize = splice_from_trigger(&trigger)?;

        println!(
            "{} {} (neg: {:?}, pos: {:?})",
            "solved stage".green(),
            stage.name,
            outcome.best_neg,
            outcome.best_pos
        );
    }

    Ok(())
}

/// Split a reproducer at the stage marker: the next stage's candidates are
/// inserted where the marker sat.
fn splice_from_trigger(path: &Path) -> Result<Materialize> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading reproducer {}", path.display()))?;
    let lines: Vec<String> = content.lines().map(str::to_string).collect();

    let marker = lines
        .iter()
        .position(|line| line == STAGE_MARKER)
        .ok_or_else(|| anyhow!("reproducer {} carries no stage marker", path.display()))?;

    let prefix = lines[..marker].to_vec();
    let suffix = lines[marker + 1..].to_vec();
    Ok(Materialize::Splice { prefix, suffix })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_yaml_plan_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.yaml");
        fs::write(
            &path,
            "stages:\n\
             - first_size: 64\n\
             \x20 second_size: 576\n\
             \x20 cutoff: 16\n\
             - name: landing\n\
             \x20 first_size: 128\n\
             \x20 second_size: 128\n\
             \x20 cutoff: 8\n\
             \x20 generator: pair-sl1024-afr98\n\
             \x20 side: neg\n\
             \x20 time_limit: 300\n",
        )
        .unwrap();

        let plan = load_plan(&path).unwrap();
        assert_eq!(plan.stages.len(), 2);
        assert_eq!(plan.stages[0].name, "stage-1");
        assert_eq!(plan.stages[0].generator, GeneratorPreset::Adaptive);
        assert_eq!(plan.stages[0].side, Side::Pos);
        assert_eq!(plan.stages[1].name, "landing");
        assert_eq!(plan.stages[1].generator, GeneratorPreset::PairSl1024Afr98);
        assert_eq!(plan.stages[1].side, Side::Neg);
        assert_eq!(plan.stages[1].time_limit, Some(300));
    }

    #[test]
    fn test_empty_plan_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.json");
        fs::write(&path, r#"{"stages": []}"#).unwrap();
        assert!(load_plan(&path).is_err());
    }

    #[test]
    fn test_splice_from_trigger_splits_at_the_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(POS_TRIGGER_FILE);
        fs::write(
            &path,
            format!("vtx alloc 32 100\n\nvtx src 64\n{STAGE_MARKER}\nvtx dst 64\n"),
        )
        .unwrap();

        let materialize = splice_from_trigger(&path).unwrap();
        match materialize {
            Materialize::Splice { prefix, suffix } => {
                assert_eq!(prefix, vec!["vtx alloc 32 100", "", "vtx src 64"]);
                assert_eq!(suffix, vec!["vtx dst 64"]);
            }
            other => panic!("expected a splice, got {other:?}"),
        }
    }

    #[test]
    fn test_trigger_without_marker_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(NEG_TRIGGER_FILE);
        fs::write(&path, "vtx src 64\nvtx dst 64\n").unwrap();
        assert!(splice_from_trigger(&path).is_err());
    }
}

// SPDX-License-Identifier: PMPL-1.0-or-later

//! heapgap: parallel black-box search for heap layout primitives.
//!
//! Drives an external allocator oracle with candidate interaction sequences
//! to place two named allocations at a target relative distance, manages
//! batches of such experiments, and solves multi-stage distance plans.

use anyhow::{bail, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use colored::Colorize;
use heapgap::experiments::{self, ExperimentRecord};
use heapgap::fragments::FragmentStore;
use heapgap::minimize;
use heapgap::solve;
use heapgap::start::StartingState;
use heapgap::types::{GeneratorPreset, RunConfig};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "heapgap")]
#[command(version)]
#[command(about = "Black-box search for heap allocator layout primitives")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Minimize the distance between two named allocations
    Minimize {
        /// The oracle executable replaying sequence files
        #[arg(long)]
        oracle: PathBuf,

        /// Size of the first named allocation
        #[arg(short = 'f', long)]
        first_size: u64,

        /// Size of the second named allocation
        #[arg(short = 's', long)]
        second_size: u64,

        /// Number of concurrent search workers
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Directory for reproducers and the result record (must not exist)
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Wall-clock budget in seconds
        #[arg(short, long)]
        time_limit: Option<u64>,

        /// Total execution budget
        #[arg(short, long)]
        execution_limit: Option<u64>,

        /// Absolute distance on each side that counts as solved
        #[arg(short, long, default_value = "4")]
        cutoff: i64,

        /// Starting allocator state: "default", "random", or a trace file
        #[arg(long, default_value = "default")]
        starting_state: String,

        /// Candidate generator preset
        #[arg(short, long, value_enum, default_value = "synth-small")]
        generator: GeneratorArg,
    },

    /// Solve a staged multi-distance plan
    Solve {
        /// The solve plan (YAML or JSON)
        #[arg(value_name = "PLAN")]
        plan: PathBuf,

        /// The oracle executable
        #[arg(long)]
        oracle: PathBuf,

        /// Fragment store files to validate the plan against
        #[arg(long = "fragments")]
        fragments: Vec<PathBuf>,

        /// Output directory for per-stage results
        #[arg(short, long)]
        output_dir: PathBuf,

        /// Number of concurrent search workers per stage
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Starting allocator state: "default", "random", or a trace file
        #[arg(long, default_value = "default")]
        starting_state: String,
    },

    /// Re-run the unsuccessful experiments beneath a results directory
    Rerun {
        /// Directory containing earlier experiment results
        #[arg(value_name = "RESULTS")]
        results: PathBuf,
    },

    /// Inspect fragment stores
    Store {
        /// Fragment store files to load and merge
        #[arg(value_name = "STORE", required = true)]
        fragments: Vec<PathBuf>,

        /// Report the fragments available for one allocation size
        #[arg(short, long)]
        size: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum GeneratorArg {
    SynthSmall,
    StringDup,
    Pair,
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

impl From<GeneratorArg> for GeneratorPreset {
    fn from(arg: GeneratorArg) -> Self {
        match arg {
            GeneratorArg::SynthSmall => GeneratorPreset::SynthSmall,
            GeneratorArg::StringDup => GeneratorPreset::StringDup,
            GeneratorArg::Pair => GeneratorPreset::Pair,
            GeneratorArg::Adaptive => GeneratorPreset::Adaptive,
            GeneratorArg::PairSl1024Afr55 => GeneratorPreset::PairSl1024Afr55,
            GeneratorArg::PairSl256Afr98 => GeneratorPreset::PairSl256Afr98,
            GeneratorArg::PairSl8192Afr100 => GeneratorPreset::PairSl8192Afr100,
            GeneratorArg::PairSl1024Afr98 => GeneratorPreset::PairSl1024Afr98,
            GeneratorArg::Guard1Sl1024Afr98 => GeneratorPreset::Guard1Sl1024Afr98,
            GeneratorArg::Guard4Sl1024Afr98 => GeneratorPreset::Guard4Sl1024Afr98,
            GeneratorArg::Guard16Sl1024Afr98 => GeneratorPreset::Guard16Sl1024Afr98,
            GeneratorArg::HalfGuard4Sl1024Afr98 => GeneratorPreset::HalfGuard4Sl1024Afr98,
        }
    }
}

fn default_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Minimize {
            oracle,
            first_size,
            second_size,
            jobs,
            output_dir,
            time_limit,
            execution_limit,
            cutoff,
            starting_state,
            generator,
        } => {
            let jobs = jobs.unwrap_or_else(default_jobs);
            let output_dir = output_dir.unwrap_or_else(|| {
                std::env::temp_dir()
                    .join(format!("heapgap-{}", Local::now().format("%Y-%m-%d-%H-%M-%S")))
            });
            if output_dir.exists() {
                bail!("output directory {} already exists", output_dir.display());
            }

            let state = StartingState::parse(&starting_state);
            let starting_config = state.build()?;
            println!(
                "starting state '{}' ({} events)",
                state.label(),
                starting_config.len()
            );

            let config = RunConfig {
                oracle,
                starting_state: state.label(),
                generator: generator.into(),
                first_size,
                second_size,
                jobs,
                time_limit,
                execution_limit,
                cutoff: Some(cutoff),
            };
            println!(
                "running on {} workers (time limit: {:?}, execution limit: {:?}, cutoff: {})",
                jobs, time_limit, execution_limit, cutoff
            );

            let outcome = minimize::run(&config, &starting_config, &output_dir)?;

            println!("min. negative distance: {:?}", outcome.best_neg);
            println!("min. positive distance: {:?}", outcome.best_pos);

            let solved = outcome.solved(config.cutoff);
            let record = ExperimentRecord::new(config, outcome);
            let path = experiments::persist(&record, &output_dir)?;
            println!("result record written to {}", path.display());

            if !solved {
                bail!("cutoff not reached ({})", record.config);
            }
            println!("{}", "cutoff reached on both sides".green());
            Ok(())
        }

        Commands::Solve {
            plan,
            oracle,
            fragments,
            output_dir,
            jobs,
            starting_state,
        } => {
            let jobs = jobs.unwrap_or_else(default_jobs);
            let plan = solve::load_plan(&plan)?;
            println!("plan contains {} stages", plan.stages.len());

            if !fragments.is_empty() {
                let store = FragmentStore::load(&fragments)?;
                println!(
                    "{} unique sequences across {} fragments loaded",
                    store.num_sequences(),
                    store.num_fragments()
                );
                solve::check_store(&plan, &store)?;
            }

            let starting_config = StartingState::parse(&starting_state).build()?;
            solve::run(&plan, &oracle, starting_config, &output_dir, jobs)?;
            println!("{}", "all stages solved".green());
            Ok(())
        }

        Commands::Rerun { results } => {
            let records = experiments::unsuccessful(&results)?;
            println!("{} experiments to rerun", records.len());

            let output_dir = results.with_file_name(format!(
                "{}_rerun",
                results
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "results".to_string())
            ));
            if output_dir.exists() {
                bail!("directory {} already exists", output_dir.display());
            }
            std::fs::create_dir_all(&output_dir)?;
            println!("results will be saved in {}", output_dir.display());

            for record in &records {
                experiments::rerun(record, &output_dir)?;
            }
            Ok(())
        }

        Commands::Store { fragments, size } => {
            let store = FragmentStore::load(&fragments)?;
            println!(
                "{} unique sequences across {} fragments",
                store.num_sequences(),
                store.num_fragments()
            );

            if let Some(size) = size {
                match store.fragments_for_size(size) {
                    Some(entries) => {
                        println!("{} fragments allocate size {}", entries.len(), size);
                        let shortest = store
                            .shortest_fragments_for_size(size)
                            .expect("a populated size class has shortest entries");
                        println!(
                            "shortest sequence length {} ({} alternates)",
                            shortest[0].1.len,
                            shortest.len()
                        );
                    }
                    None => println!("no fragments allocate size {}", size),
                }
            }
            Ok(())
        }
    }
}

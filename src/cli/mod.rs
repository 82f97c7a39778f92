// src/cli/mod.rs — CLI definition (clap derive)

pub mod progress;
pub mod report;
pub mod run;
pub mod status;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "sciloop",
    about = "Budgeted plan/run/analyze loop over experiment configurations",
    version
)]
pub struct Cli {
    /// Config file path
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run cycles until the budget or the cycle limit is reached (default)
    Run(RunArgs),
    /// Show the last committed cycle state and recent runs
    Status {
        /// Number of past runs to list
        #[arg(long, default_value = "5")]
        history: usize,
    },
    /// Show the latest Pareto front snapshot per stratum
    Front {
        /// Only this stratum (e.g. "compression_ratio=16", or "global")
        #[arg(long)]
        stratum: Option<String>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// List insights produced by the analyzer
    Insights {
        /// Only insights from this cycle
        #[arg(long)]
        cycle: Option<u32>,
        /// Most recent N insights
        #[arg(long, default_value = "10")]
        limit: usize,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Override experiment.budget
    #[arg(long)]
    pub budget: Option<u32>,

    /// Override experiment.max_cycles
    #[arg(long)]
    pub cycles: Option<u32>,

    /// Discard any checkpoint left by an interrupted run
    #[arg(long)]
    pub fresh: bool,

    /// Suppress progress output (only print the final report)
    #[arg(long)]
    pub quiet: bool,
}

// src/cli/run.rs — Default command: drive the cycle engine to termination

use std::sync::Arc;

use super::progress;
use super::report::print_fronts;
use super::RunArgs;
use crate::agents::analyzer::StatisticalAnalyzer;
use crate::agents::planner::GridPlanner;
use crate::agents::reviewer::DesignSpaceReviewer;
use crate::core::bus::EventBus;
use crate::core::checkpoint::{FileStateStore, StateStore};
use crate::core::engine::{Collaborators, CycleEngine, RunReport};
use crate::infra::config::Config;
use crate::infra::paths;
use crate::memory;
use crate::runner::simulator::SimulatedRunner;

/// Apply command-line overrides on top of the loaded config.
pub fn apply_overrides(config: &Config, args: &RunArgs) -> Config {
    let mut config = config.clone();
    if let Some(budget) = args.budget {
        config.experiment.budget = budget;
    }
    if let Some(cycles) = args.cycles {
        config.experiment.max_cycles = cycles;
    }
    config
}

/// Run cycles against the simulated runner with the built-in collaborators.
pub async fn run_cycles(config: &Config, args: &RunArgs) -> anyhow::Result<()> {
    let config = apply_overrides(config, args);
    config.validate()?;
    paths::ensure_dirs().await?;

    let store = Arc::new(memory::open(&config.storage.db_path())?);
    let checkpoint = Arc::new(FileStateStore::new(config.storage.state_path()));
    if args.fresh {
        checkpoint.clear()?;
    } else if let Some(state) = checkpoint.load()? {
        if !state.is_terminated() {
            eprintln!(
                "Resuming run {} at cycle {} ({}); use --fresh to start over.",
                short_id(&state.run_id),
                state.cycle,
                state.phase
            );
        }
    }

    let bus = Arc::new(EventBus::new(&config.bus));
    if !args.quiet {
        bus.subscribe_all(progress::terminal_progress());
    }

    let collaborators = Collaborators {
        planner: Arc::new(GridPlanner::new(
            config.design_space.clone(),
            config.pareto.objectives.clone(),
        )),
        reviewer: Arc::new(DesignSpaceReviewer::new(config.design_space.clone())),
        analyzer: Arc::new(StatisticalAnalyzer::new()),
    };
    let runner = Arc::new(SimulatedRunner::new(config.simulator.clone()));
    let engine = CycleEngine::new(config, collaborators, runner, store, checkpoint, bus.clone())?;

    // Ctrl-C cancels the run; the engine still commits a final state.
    let token = engine.cancellation_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!();
            eprintln!("Cancelling run...");
            token.cancel();
        }
    });

    let report = engine.run().await;
    interrupt.abort();
    bus.shutdown().await;

    let report = report?;
    print_report(&report);
    if report.is_fatal() {
        anyhow::bail!("run terminated: {}", report.reason);
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    let state = &report.state;
    println!("Run {}", short_id(&state.run_id));
    println!("  Stopped in: {}", report.stopped_in);
    println!("  Reason:     {}", report.reason);
    println!("  Cycles:     {}", state.cycle);
    println!(
        "  Budget:     {}/{} used",
        state.budget_consumed, state.budget_total
    );
    if !report.fronts.is_empty() {
        println!();
        print_fronts(&report.fronts);
    }
}

pub(crate) fn short_id(id: &str) -> &str {
    &id[..8.min(id.len())]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_replace_file_values() {
        let config = Config::default();
        let args = RunArgs {
            budget: Some(7),
            cycles: Some(2),
            ..RunArgs::default()
        };
        let merged = apply_overrides(&config, &args);
        assert_eq!(merged.experiment.budget, 7);
        assert_eq!(merged.experiment.max_cycles, 2);
        assert_eq!(merged.experiment.batch_size, config.experiment.batch_size);
    }

    #[test]
    fn test_no_overrides_keeps_config() {
        let config = Config::default();
        let merged = apply_overrides(&config, &RunArgs::default());
        assert_eq!(merged.experiment.budget, config.experiment.budget);
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef"), "01234567");
        assert_eq!(short_id("abc"), "abc");
    }
}

// src/cli/status.rs — Last committed cycle state and run history

use super::run::short_id;
use crate::core::checkpoint::{FileStateStore, RunHistoryEntry, StateStore};
use crate::core::types::CycleState;
use crate::infra::config::Config;
use crate::infra::paths;
use crate::memory::{self, ObjectiveStore};

/// `sciloop status`.
pub async fn show_status(config: &Config, history: usize) -> anyhow::Result<()> {
    println!("sciloop v{}", env!("CARGO_PKG_VERSION"));
    println!();

    let config_path = paths::config_file_path();
    if config_path.exists() {
        println!("  Config:     {} (loaded)", config_path.display());
    } else {
        println!("  Config:     (using defaults)");
    }

    let db_path = config.storage.db_path();
    if db_path.exists() {
        let size = std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);
        let results = memory::open(&db_path)
            .and_then(|s| s.count_results())
            .unwrap_or(0);
        println!(
            "  Database:   {} ({}, {} result(s))",
            db_path.display(),
            format_bytes(size),
            results
        );
    } else {
        println!("  Database:   (not initialized)");
    }

    let checkpoint = FileStateStore::new(config.storage.state_path());
    println!();
    match checkpoint.load() {
        Ok(Some(state)) => print_state(&state),
        Ok(None) => println!("  No run recorded yet."),
        Err(e) => println!("  Checkpoint unreadable: {e}"),
    }

    let runs = checkpoint.read_history(history);
    if !runs.is_empty() {
        println!();
        println!("  Recent runs:");
        for entry in runs.iter().rev() {
            println!("    {}", format_run(entry));
        }
    }
    Ok(())
}

fn print_state(state: &CycleState) {
    let label = if state.is_terminated() {
        "Last run"
    } else {
        "Current run"
    };
    println!("  {label}:   {}", short_id(&state.run_id));
    println!("    Cycle:    {}", state.cycle);
    match (&state.terminal, state.stopped_in) {
        (Some(reason), Some(phase)) => {
            println!("    Phase:    terminated in {phase}");
            println!("    Reason:   {reason}");
        }
        (Some(reason), None) => println!("    Reason:   {reason}"),
        _ => println!("    Phase:    {}", state.phase),
    }
    println!(
        "    Budget:   {} {}/{}",
        render_progress_bar(state.budget_consumed, state.budget_total, 20),
        state.budget_consumed,
        state.budget_total
    );
    if !state.outstanding.is_empty() {
        println!("    Outstanding:");
        for task in &state.outstanding {
            println!(
                "      {} task={} retries={}",
                task.config_id,
                task.task_id.as_deref().unwrap_or("-"),
                task.retries
            );
        }
    }
    if state.review_retries > 0 {
        println!("    Review retries: {}", state.review_retries);
    }
    println!(
        "    Updated:  {}",
        state.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
}

fn format_run(entry: &RunHistoryEntry) -> String {
    format!(
        "{} | {} cycle(s), budget {}/{}, {}{}",
        short_id(&entry.run_id),
        entry.cycles,
        entry.budget_consumed,
        entry.budget_total,
        entry.reason,
        if entry.fatal { " (fatal)" } else { "" }
    )
}

fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_048_576 {
        format!("{:.1}MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1}KB", bytes as f64 / 1024.0)
    } else {
        format!("{}B", bytes)
    }
}

/// Render a simple ASCII progress bar: [=====     ]
fn render_progress_bar(current: u32, max: u32, width: usize) -> String {
    if max == 0 {
        return format!("[{}]", " ".repeat(width));
    }
    let clamped = current.min(max) as usize;
    let filled = (clamped * width) / (max as usize);
    let empty = width.saturating_sub(filled);
    format!("[{}{}]", "=".repeat(filled), " ".repeat(empty))
}

// src/cli/progress.rs — Terminal progress renderer for a running engine

use std::sync::Arc;

use crate::core::bus::{handler_fn, EngineEvent, Event, EventHandler};
use crate::core::types::Phase;

/// Bus subscriber that writes progress lines to stderr.
///
/// All progress output goes to stderr so stdout stays clean for the final
/// report.
pub fn terminal_progress() -> Arc<dyn EventHandler> {
    handler_fn(|event: &Event| {
        if let Some(line) = format_event(&event.payload) {
            eprintln!("{line}");
        }
        Ok(())
    })
}

/// One progress line per event worth showing; `None` for the rest.
pub fn format_event(event: &EngineEvent) -> Option<String> {
    match event {
        EngineEvent::PhaseChanged { cycle, to, .. } => match to {
            Phase::Planning => Some(format!("[cycle {cycle}] planning...")),
            Phase::Analyzing => Some(format!("[cycle {cycle}] analyzing...")),
            _ => None,
        },
        EngineEvent::PlanProposed {
            cycle,
            attempt,
            config_ids,
        } => Some(format!(
            "[cycle {cycle}] plan #{attempt}: {} configuration(s)",
            config_ids.len()
        )),
        EngineEvent::PlanRejected {
            cycle, attempt, feedback,
        } => Some(format!(
            "[cycle {cycle}] plan #{attempt} rejected: {}",
            first_line(feedback)
        )),
        EngineEvent::PlanApproved { cycle, size } => {
            Some(format!("[cycle {cycle}] executing {size} experiment(s)"))
        }
        EngineEvent::ExperimentSubmitted { .. } => None,
        EngineEvent::ExperimentRetrying {
            cycle,
            config_id,
            attempt,
            reason,
        } => Some(format!(
            "[cycle {cycle}]   retry {config_id} after attempt {attempt}: {reason}"
        )),
        EngineEvent::ExperimentCompleted {
            cycle,
            config_id,
            status,
            objectives,
        } => {
            let scores = objectives
                .iter()
                .map(|(k, v)| format!("{k}={v:.2}"))
                .collect::<Vec<_>>()
                .join(" ");
            Some(format!("[cycle {cycle}]   {config_id} {status} {scores}").trim_end().to_string())
        }
        EngineEvent::FrontUpdated {
            cycle,
            stratum,
            size,
        } => Some(format!(
            "[cycle {cycle}] front {}: {size} member(s)",
            stratum.as_deref().unwrap_or("global")
        )),
        EngineEvent::InsightGenerated { cycle, summary } => {
            Some(format!("[cycle {cycle}] insight: {}", first_line(summary)))
        }
        EngineEvent::RunTerminated {
            cycle,
            reason,
            budget_consumed,
            budget_total,
        } => Some(format!(
            "[done] {reason} after {cycle} cycle(s), budget {budget_consumed}/{budget_total}"
        )),
    }
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or("")
}

// src/agents/analyzer.rs — Statistical analyzer
//
// Produces one insight per cycle: success counts, front size, how many
// results each front member dominates, and per-objective trend deltas of
// the best value this cycle versus all earlier cycles.

use std::collections::BTreeMap;

use async_trait::async_trait;

use super::{AnalysisInput, Analyzer};
use crate::core::pareto::{self, Objective};
use crate::core::types::{ExperimentResult, Insight, InsightStats};
use crate::infra::errors::CollaboratorError;

#[derive(Default)]
pub struct StatisticalAnalyzer;

impl StatisticalAnalyzer {
    pub fn new() -> Self {
        Self
    }
}

/// Best oriented value of `objective` among `results`, if any carry it.
fn best(results: &[&ExperimentResult], objective: &Objective) -> Option<f64> {
    results
        .iter()
        .filter_map(|r| r.objectives.get(&objective.name))
        .map(|v| objective.oriented(*v))
        .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))))
}

fn trend_deltas(input: &AnalysisInput, succeeded: &[ExperimentResult]) -> BTreeMap<String, f64> {
    let (current, earlier): (Vec<&ExperimentResult>, Vec<&ExperimentResult>) = succeeded
        .iter()
        .filter(|r| r.cycle <= input.cycle)
        .partition(|r| r.cycle == input.cycle);

    input
        .objectives
        .iter()
        .filter_map(|o| {
            let now = best(&current, o)?;
            let before = best(&earlier, o)?;
            Some((o.name.clone(), now - before))
        })
        .collect()
}

#[async_trait]
impl Analyzer for StatisticalAnalyzer {
    fn name(&self) -> &str {
        "statistical-analyzer"
    }

    async fn analyze(&self, input: &AnalysisInput) -> Result<Vec<Insight>, CollaboratorError> {
        let succeeded: Vec<ExperimentResult> = input
            .history
            .iter()
            .filter(|r| r.is_succeeded())
            .cloned()
            .collect();

        let counts = pareto::dominance_counts(&succeeded, &input.objectives).map_err(|e| {
            CollaboratorError::Failed {
                collaborator: self.name().to_string(),
                message: e.to_string(),
            }
        })?;

        let front_ids: Vec<&str> = input
            .fronts
            .iter()
            .flat_map(|f| f.members.iter().map(|m| m.result.id.as_str()))
            .collect();
        let dominance_counts = counts
            .into_iter()
            .filter(|(id, _)| front_ids.contains(&id.as_str()))
            .collect();

        let stats = InsightStats {
            results_total: input.history.len(),
            results_succeeded: succeeded.len(),
            front_size: front_ids.len(),
            strata: input.fronts.len(),
            dominance_counts,
            trend_deltas: trend_deltas(input, &succeeded),
        };

        let mut summary = format!(
            "Cycle {}: {}/{} experiments succeeded; front holds {} member(s) across {} stratum(s)",
            input.cycle,
            stats.results_succeeded,
            stats.results_total,
            stats.front_size,
            stats.strata,
        );
        if !stats.trend_deltas.is_empty() {
            let trends: Vec<String> = stats
                .trend_deltas
                .iter()
                .map(|(name, delta)| format!("{name} {delta:+.3}"))
                .collect();
            summary.push_str(&format!("; best-value trend: {}", trends.join(", ")));
        }

        Ok(vec![Insight::new(input.cycle, self.name(), summary, stats)])
    }
}

// src/agents/planner.rs — Deterministic design-space planner
//
// Proposes neighbours of the current Pareto front first (exploit), then
// spreads the rest of the batch evenly over unexplored grid points
// (explore). Never proposes a configuration that already ran.

use std::collections::HashSet;

use async_trait::async_trait;

use super::{DesignSpace, PlanRequest, Planner};
use crate::core::pareto::{self, Objective};
use crate::core::types::{ConfigId, Configuration, ExperimentStatus};
use crate::infra::errors::CollaboratorError;

pub struct GridPlanner {
    space: DesignSpace,
    objectives: Vec<Objective>,
}

impl GridPlanner {
    pub fn new(space: DesignSpace, objectives: Vec<Objective>) -> Self {
        Self { space, objectives }
    }

    /// Configurations one grid step away from `config` along any dimension.
    fn neighbours(&self, config: &Configuration) -> Vec<Configuration> {
        let mut out = Vec::new();
        for (name, values) in self.space.dimensions() {
            let Some(current) = config.get(name) else {
                continue;
            };
            let Some(pos) = values.iter().position(|v| v == current) else {
                continue;
            };
            let adjacent = [pos.checked_sub(1), Some(pos + 1)];
            for idx in adjacent.into_iter().flatten() {
                if let Some(value) = values.get(idx) {
                    let mut params = config.params().clone();
                    params.insert(name.clone(), value.clone());
                    if let Ok(c) = Configuration::new(params) {
                        out.push(c);
                    }
                }
            }
        }
        out
    }
}

#[async_trait]
impl Planner for GridPlanner {
    fn name(&self) -> &str {
        "grid-planner"
    }

    async fn plan(
        &self,
        request: PlanRequest<'_>,
    ) -> Result<Vec<Configuration>, CollaboratorError> {
        let want = request.budget_remaining as usize;
        if want == 0 {
            return Ok(Vec::new());
        }

        // Anything that ran to a verdict is explored; cancelled runs may be retried.
        let mut taken: HashSet<ConfigId> = request
            .history
            .iter()
            .filter(|r| r.status != ExperimentStatus::Cancelled)
            .map(|r| r.config_id().clone())
            .collect();
        let rejected = |c: &Configuration| {
            request
                .feedback
                .is_some_and(|f| f.contains(c.id().as_str()))
        };

        let mut batch = Vec::with_capacity(want);

        // Exploit: neighbours of the current front.
        let succeeded: Vec<_> = request
            .history
            .iter()
            .filter(|r| r.is_succeeded())
            .cloned()
            .collect();
        if let Ok(front) = pareto::compute_front(&succeeded, &self.objectives) {
            for member in &front.members {
                for candidate in self.neighbours(&member.configuration) {
                    if batch.len() >= want.div_ceil(2) {
                        break;
                    }
                    if !rejected(&candidate) && taken.insert(candidate.id().clone()) {
                        batch.push(candidate);
                    }
                }
            }
        }

        // Explore: evenly spaced unexplored grid points.
        let grid = self.space.grid().map_err(|e| CollaboratorError::Failed {
            collaborator: self.name().to_string(),
            message: e.to_string(),
        })?;
        let unexplored: Vec<Configuration> = grid
            .into_iter()
            .filter(|c| !taken.contains(c.id()) && !rejected(c))
            .collect();
        let need = want - batch.len();
        if need > 0 && !unexplored.is_empty() {
            let picks = need.min(unexplored.len());
            for j in 0..picks {
                batch.push(unexplored[j * unexplored.len() / picks].clone());
            }
        }

        tracing::debug!(
            cycle = request.cycle,
            proposed = batch.len(),
            "Grid planner proposal"
        );
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ExperimentResult, ParamValue};
    use chrono::Utc;

    fn space() -> DesignSpace {
        DesignSpace::new()
            .with("a", vec![ParamValue::Int(1), ParamValue::Int(2), ParamValue::Int(3)])
            .with("b", vec![ParamValue::Int(10), ParamValue::Int(20)])
    }

    fn planner() -> GridPlanner {
        GridPlanner::new(space(), vec![Objective::maximize("score")])
    }

    fn ran(config: &Configuration, score: f64) -> ExperimentResult {
        ExperimentResult::succeeded(
            1,
            config.clone(),
            [("score".to_string(), score)].into_iter().collect(),
            Utc::now(),
        )
    }

    fn request<'a>(
        history: &'a [ExperimentResult],
        feedback: Option<&'a str>,
        budget: u32,
    ) -> PlanRequest<'a> {
        PlanRequest {
            cycle: 1,
            history,
            feedback,
            budget_remaining: budget,
        }
    }

    #[tokio::test]
    async fn test_first_plan_spreads_over_grid() {
        let plan = planner().plan(request(&[], None, 3)).await.unwrap();
        assert_eq!(plan.len(), 3);
        let ids: HashSet<_> = plan.iter().map(|c| c.id().clone()).collect();
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn test_never_reproposes_history() {
        let p = planner();
        let grid = space().grid().unwrap();
        let history: Vec<_> = grid[..4].iter().map(|c| ran(c, 1.0)).collect();
        let plan = p.plan(request(&history, None, 10)).await.unwrap();
        assert_eq!(plan.len(), 2);
        for c in &plan {
            assert!(!history.iter().any(|h| h.config_id() == c.id()));
        }
    }

    #[tokio::test]
    async fn test_exploits_front_neighbours() {
        let p = planner();
        let best = Configuration::from_pairs([("a", ParamValue::Int(2)), ("b", ParamValue::Int(10))])
            .unwrap();
        let history = vec![ran(&best, 9.0)];
        let plan = p.plan(request(&history, None, 2)).await.unwrap();
        assert_eq!(plan.len(), 2);
        assert!(p.neighbours(&best).iter().any(|n| n.id() == plan[0].id()));
    }

    #[tokio::test]
    async fn test_feedback_excludes_named_configs() {
        let p = planner();
        let first = p.plan(request(&[], None, 6)).await.unwrap();
        let feedback = format!("{}: rejected", first[0].id());
        let second = p.plan(request(&[], Some(&feedback), 6)).await.unwrap();
        assert_eq!(second.len(), 5);
        assert!(!second.iter().any(|c| c.id() == first[0].id()));
    }

    #[tokio::test]
    async fn test_zero_budget_plans_nothing() {
        assert!(planner().plan(request(&[], None, 0)).await.unwrap().is_empty());
    }
}

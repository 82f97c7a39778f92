// src/memory/in_memory.rs — Objective store held in process memory

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use super::{keep_last, stratum_label, FrontSnapshot, InsightFilter, ObjectiveStore, ResultFilter};
use crate::core::pareto::RankedFront;
use crate::core::types::{ConfigId, Configuration, ExperimentResult, Insight};
use crate::infra::errors::StoreError;

#[derive(Default)]
struct Tables {
    configurations: HashMap<ConfigId, Configuration>,
    results: Vec<ExperimentResult>,
    insights: Vec<Insight>,
    /// stratum label -> cycle -> front
    fronts: BTreeMap<String, BTreeMap<u32, RankedFront>>,
}

/// Same contract as the SQLite store, without durability.
#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl ObjectiveStore for InMemoryStore {
    fn append_result(&self, result: &ExperimentResult) -> Result<(), StoreError> {
        let mut t = self.tables()?;
        if t.results.iter().any(|r| r.id == result.id) {
            return Err(StoreError::Duplicate {
                kind: "experiment",
                id: result.id.clone(),
            });
        }
        match t.configurations.get(result.config_id()) {
            Some(existing) if existing.params() != result.configuration.params() => {
                return Err(StoreError::Conflict {
                    id: result.config_id().to_string(),
                });
            }
            Some(_) => {}
            None => {
                t.configurations
                    .insert(result.config_id().clone(), result.configuration.clone());
            }
        }
        t.results.push(result.clone());
        Ok(())
    }

    fn append_insight(&self, insight: &Insight) -> Result<(), StoreError> {
        let mut t = self.tables()?;
        if t.insights.iter().any(|i| i.id == insight.id) {
            return Err(StoreError::Duplicate {
                kind: "insight",
                id: insight.id.clone(),
            });
        }
        t.insights.push(insight.clone());
        Ok(())
    }

    fn query_results(&self, filter: &ResultFilter) -> Result<Vec<ExperimentResult>, StoreError> {
        let t = self.tables()?;
        let matched = t
            .results
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        Ok(keep_last(matched, filter.limit))
    }

    fn query_insights(&self, filter: &InsightFilter) -> Result<Vec<Insight>, StoreError> {
        let t = self.tables()?;
        let matched = t
            .insights
            .iter()
            .filter(|i| filter.cycle.map_or(true, |c| i.cycle == c))
            .cloned()
            .collect();
        Ok(keep_last(matched, filter.limit))
    }

    fn append_front_snapshot(&self, cycle: u32, front: &RankedFront) -> Result<(), StoreError> {
        let label = stratum_label(front.stratum.as_deref()).to_string();
        let mut t = self.tables()?;
        for member in &front.members {
            if !t.results.iter().any(|r| r.id == member.result.id) {
                return Err(StoreError::Corrupt {
                    id: member.result.id.clone(),
                    message: "front member has no stored result".into(),
                });
            }
        }
        let by_cycle = t.fronts.entry(label.clone()).or_default();
        if by_cycle.contains_key(&cycle) {
            return Err(StoreError::Duplicate {
                kind: "front snapshot",
                id: format!("{cycle}/{label}"),
            });
        }
        by_cycle.insert(cycle, front.clone());
        Ok(())
    }

    fn latest_fronts(&self, stratum: Option<&str>) -> Result<Vec<FrontSnapshot>, StoreError> {
        let t = self.tables()?;
        Ok(t
            .fronts
            .iter()
            .filter(|(label, _)| stratum.map_or(true, |s| s == label.as_str()))
            .filter_map(|(_, by_cycle)| {
                by_cycle.iter().next_back().map(|(cycle, front)| FrontSnapshot {
                    cycle: *cycle,
                    front: front.clone(),
                })
            })
            .collect())
    }
}

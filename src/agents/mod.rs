// src/agents/mod.rs — Collaborator contracts consumed by the cycle engine
//
// Planner, Reviewer and Analyzer are external collaborators (usually
// language-model backed). The engine only sees these traits; concrete
// implementations are injected at construction. The built-in
// implementations here are deterministic and need no model.

pub mod analyzer;
pub mod planner;
pub mod reviewer;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::pareto::{Objective, RankedFront};
use crate::core::types::{Configuration, ExperimentResult, Insight, ParamValue};
use crate::infra::errors::{CollaboratorError, ValidationError};

/// Upper bound on grid points enumerated from a design space.
const MAX_GRID_POINTS: usize = 100_000;

/// Everything a planner sees when proposing a batch.
#[derive(Debug, Clone, Copy)]
pub struct PlanRequest<'a> {
    pub cycle: u32,
    pub history: &'a [ExperimentResult],
    /// Reviewer feedback from a rejected plan earlier in this cycle.
    pub feedback: Option<&'a str>,
    /// Maximum number of configurations the engine will accept.
    pub budget_remaining: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewVerdict {
    pub approved: bool,
    pub feedback: String,
}

impl ReviewVerdict {
    pub fn approve() -> Self {
        Self {
            approved: true,
            feedback: String::new(),
        }
    }

    pub fn reject(feedback: impl Into<String>) -> Self {
        Self {
            approved: false,
            feedback: feedback.into(),
        }
    }
}

/// Input to the analyzer: the full history plus the current fronts.
#[derive(Debug, Clone)]
pub struct AnalysisInput {
    pub cycle: u32,
    pub objectives: Vec<Objective>,
    pub history: Vec<ExperimentResult>,
    pub fronts: Vec<RankedFront>,
}

#[async_trait]
pub trait Planner: Send + Sync {
    fn name(&self) -> &str;

    async fn plan(&self, request: PlanRequest<'_>)
        -> Result<Vec<Configuration>, CollaboratorError>;
}

/// Reviews one configuration. Treated as side-effect free.
#[async_trait]
pub trait Reviewer: Send + Sync {
    fn name(&self) -> &str;

    async fn review(&self, config: &Configuration) -> Result<ReviewVerdict, CollaboratorError>;
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    fn name(&self) -> &str;

    async fn analyze(&self, input: &AnalysisInput) -> Result<Vec<Insight>, CollaboratorError>;
}

/// Allowed values per named parameter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DesignSpace(BTreeMap<String, Vec<ParamValue>>);

impl DesignSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, values: Vec<ParamValue>) -> Self {
        self.0.insert(name.into(), values);
        self
    }

    /// The compressive-imaging space the simulator is tuned for.
    pub fn sci_default() -> Self {
        Self::new()
            .with("compression_ratio", ints(&[8, 16, 24]))
            .with(
                "mask_type",
                vec![ParamValue::from("random"), ParamValue::from("optimized")],
            )
            .with("num_stages", ints(&[5, 7, 9]))
            .with("num_features", ints(&[32, 64, 128]))
            .with("num_blocks", ints(&[2, 3, 4]))
            .with(
                "learning_rate",
                vec![ParamValue::Float(1e-4), ParamValue::Float(5e-5)],
            )
            .with(
                "activation",
                vec![ParamValue::from("ReLU"), ParamValue::from("LeakyReLU")],
            )
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty() || self.0.values().any(|v| v.is_empty())
    }

    pub fn dimensions(&self) -> impl Iterator<Item = (&String, &Vec<ParamValue>)> {
        self.0.iter()
    }

    pub fn values(&self, name: &str) -> Option<&[ParamValue]> {
        self.0.get(name).map(|v| v.as_slice())
    }

    /// Number of grid points, saturating.
    pub fn size(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        self.0
            .values()
            .fold(1usize, |acc, v| acc.saturating_mul(v.len()))
    }

    /// Every grid point in mixed-radix order (last dimension fastest),
    /// capped at an upper bound.
    pub fn grid(&self) -> Result<Vec<Configuration>, ValidationError> {
        let size = self.size().min(MAX_GRID_POINTS);
        let dims: Vec<(&String, &Vec<ParamValue>)> = self.0.iter().collect();
        (0..size)
            .map(|mut index| {
                let mut params = BTreeMap::new();
                for (name, values) in dims.iter().rev() {
                    params.insert((*name).clone(), values[index % values.len()].clone());
                    index /= values.len();
                }
                Configuration::new(params)
            })
            .collect()
    }

    /// Reasons `config` falls outside the space; empty when it fits.
    pub fn violations(&self, config: &Configuration) -> Vec<String> {
        let mut out = Vec::new();
        for (name, value) in config.params() {
            match self.0.get(name) {
                None => out.push(format!("parameter '{name}' is not in the design space")),
                Some(allowed) if !allowed.contains(value) => {
                    out.push(format!("value {value} is not allowed for '{name}'"))
                }
                Some(_) => {}
            }
        }
        for name in self.0.keys() {
            if config.get(name).is_none() {
                out.push(format!("parameter '{name}' is missing"));
            }
        }
        out
    }
}

fn ints(values: &[i64]) -> Vec<ParamValue> {
    values.iter().map(|v| ParamValue::Int(*v)).collect()
}

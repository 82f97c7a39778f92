// src/infra/config.rs — Configuration loading (TOML)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::agents::DesignSpace;
use crate::core::pareto::{self, Objective, RankingRule};
use crate::core::retry::RetryPolicy;
use crate::infra::errors::EngineError;
use crate::infra::paths;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub experiment: ExperimentConfig,

    #[serde(default)]
    pub review: ReviewConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub collaborators: CollaboratorsConfig,

    #[serde(default)]
    pub pareto: ParetoConfig,

    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub simulator: SimulatorConfig,

    #[serde(default = "DesignSpace::sci_default")]
    pub design_space: DesignSpace,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            experiment: ExperimentConfig::default(),
            review: ReviewConfig::default(),
            execution: ExecutionConfig::default(),
            collaborators: CollaboratorsConfig::default(),
            pareto: ParetoConfig::default(),
            bus: BusConfig::default(),
            storage: StorageConfig::default(),
            simulator: SimulatorConfig::default(),
            design_space: DesignSpace::sci_default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Total experiments the run may spend.
    pub budget: u32,
    pub max_cycles: u32,
    /// Upper bound on configurations planned per cycle.
    pub batch_size: u32,
    /// Whether failed and timed-out experiments count against the budget.
    pub charge_failed: bool,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            budget: 20,
            max_cycles: 5,
            batch_size: 3,
            charge_failed: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    /// Rejected plans allowed per cycle before the run terminates.
    pub max_retries: u32,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self { max_retries: 2 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Maximum experiments outstanding on the runner at once.
    pub concurrency: usize,
    pub task_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            task_timeout_secs: 600,
            poll_interval_ms: 200,
            retry: RetryPolicy::default(),
        }
    }
}

impl ExecutionConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollaboratorsConfig {
    /// Timeout for each Planner / Reviewer / Analyzer call.
    pub timeout_secs: u64,
}

impl Default for CollaboratorsConfig {
    fn default() -> Self {
        Self { timeout_secs: 120 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParetoConfig {
    pub objectives: Vec<Objective>,
    /// Parameter to stratify fronts on; one global front when unset.
    pub strata_key: Option<String>,
    /// Members retained per stratum.
    pub top_k: usize,
    pub ranking: RankingRule,
}

impl Default for ParetoConfig {
    fn default() -> Self {
        Self {
            objectives: vec![Objective::maximize("psnr"), Objective::minimize("latency")],
            strata_key: Some("compression_ratio".into()),
            top_k: 10,
            ranking: RankingRule::CrowdingDistance,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Per-invocation limit for an event handler.
    pub handler_timeout_ms: u64,
    /// Events kept in the in-memory history.
    pub history_limit: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            handler_timeout_ms: 5_000,
            history_limit: 1_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    pub db_path: Option<String>,
    pub state_path: Option<String>,
}

impl StorageConfig {
    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(paths::db_path)
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(paths::checkpoint_path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    /// Fraction of configurations that fail, in [0, 1].
    pub failure_rate: f64,
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            min_latency_ms: 50,
            max_latency_ms: 400,
            failure_rate: 0.0,
            seed: 0,
        }
    }
}

impl Config {
    /// Load config from file, falling back to defaults.
    pub fn load() -> anyhow::Result<Self> {
        let path = paths::config_file_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.execution.concurrency == 0 {
            return Err(EngineError::Config("execution.concurrency must be >= 1".into()));
        }
        if self.experiment.max_cycles == 0 {
            return Err(EngineError::Config("experiment.max_cycles must be >= 1".into()));
        }
        if self.experiment.batch_size == 0 {
            return Err(EngineError::Config("experiment.batch_size must be >= 1".into()));
        }
        if self.pareto.top_k == 0 {
            return Err(EngineError::Config("pareto.top_k must be >= 1".into()));
        }
        if self.execution.retry.max_attempts == 0 {
            return Err(EngineError::Config(
                "execution.retry.max_attempts must be >= 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.simulator.failure_rate) {
            return Err(EngineError::Config(
                "simulator.failure_rate must be within [0, 1]".into(),
            ));
        }
        pareto::validate_objectives(&self.pareto.objectives)?;
        Ok(())
    }
}

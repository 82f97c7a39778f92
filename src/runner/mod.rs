// src/runner/mod.rs — Runner abstraction consumed by the execution coordinator
//
// A runner turns one configuration into objective values. It may be an
// in-process simulator or a networked training service; the coordinator's
// timeout and retry handling is identical either way.

pub mod simulator;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::types::{Configuration, TaskId};
use crate::infra::errors::RunnerError;

/// Lifecycle state reported by a runner for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub state: TaskState,
    /// Fraction complete in [0, 1], as far as the runner knows.
    pub progress: f32,
}

impl TaskStatus {
    pub fn new(state: TaskState, progress: f32) -> Self {
        Self { state, progress }
    }
}

/// Raw objective values produced by a finished task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOutput {
    pub objectives: BTreeMap<String, f64>,
}

/// Anything that can run experiments.
///
/// Runners are untrusted: any call may fail, hang, or report a task as
/// failed. Errors are classified through `RunnerError`.
#[async_trait]
pub trait Runner: Send + Sync {
    fn id(&self) -> &str;

    async fn submit(&self, config: &Configuration) -> Result<TaskId, RunnerError>;

    async fn poll_status(&self, task: &TaskId) -> Result<TaskStatus, RunnerError>;

    /// Objectives of a completed task. For a failed task the runner returns
    /// the error that explains the failure.
    async fn fetch_result(&self, task: &TaskId) -> Result<RunOutput, RunnerError>;

    /// Best-effort abort of a task the coordinator gave up on.
    async fn cancel(&self, _task: &TaskId) -> Result<(), RunnerError> {
        Ok(())
    }
}

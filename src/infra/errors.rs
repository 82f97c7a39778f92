// src/infra/errors.rs — Error types for sciloop

use std::time::Duration;

use thiserror::Error;

/// Malformed configuration or objective data. Never retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Configuration has no parameters")]
    EmptyConfiguration,

    #[error("Parameter '{name}' is not a finite number")]
    NonFiniteParameter { name: String },

    #[error("Result '{result_id}' is missing objective '{objective}'")]
    MissingObjective { result_id: String, objective: String },

    #[error("Result '{result_id}' has non-numeric value for objective '{objective}'")]
    NonNumericObjective { result_id: String, objective: String },

    #[error("Result '{result_id}' has no parameter '{key}' to stratify on")]
    MissingStratumKey { result_id: String, key: String },

    #[error("No objectives defined")]
    NoObjectives,

    #[error("Objective '{0}' is defined more than once")]
    DuplicateObjective(String),

    #[error("Ranking weight refers to unknown objective '{0}'")]
    UnknownWeight(String),
}

/// Failures surfaced by a runner or by the execution coordinator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RunnerError {
    #[error("Runner '{runner}' unavailable: {message}")]
    Unavailable { runner: String, message: String },

    #[error("Runner '{runner}' rejected configuration: {message}")]
    Rejected { runner: String, message: String },

    #[error("Task timed out after {}ms", .after.as_millis())]
    Timeout { after: Duration },

    #[error("Runner '{runner}' internal error: {message}")]
    Internal { runner: String, message: String },

    #[error("Execution cancelled")]
    Cancelled,
}

impl RunnerError {
    /// Connection failures, timeouts and internal errors may succeed on a
    /// later attempt. Rejections and cancellations never will.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            RunnerError::Unavailable { .. }
                | RunnerError::Timeout { .. }
                | RunnerError::Internal { .. }
        )
    }
}

/// Planner / Reviewer / Analyzer failures. Absorbed by the engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CollaboratorError {
    #[error("{collaborator} unavailable: {message}")]
    Unavailable {
        collaborator: String,
        message: String,
    },

    #[error("{collaborator} did not answer within {}s", .after.as_secs())]
    Timeout {
        collaborator: String,
        after: Duration,
    },

    #[error("{collaborator} failed: {message}")]
    Failed {
        collaborator: String,
        message: String,
    },
}

/// Objective store and checkpoint persistence failures.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{kind} '{id}' already exists")]
    Duplicate { kind: &'static str, id: String },

    #[error("Configuration '{id}' already stored with different parameters")]
    Conflict { id: String },

    #[error("Stored record '{id}' is unreadable: {message}")]
    Corrupt { id: String, message: String },

    #[error("Store lock poisoned")]
    Poisoned,
}

/// Errors that stop the cycle engine from making progress.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Persistence failed: {0}")]
    Store(#[from] StoreError),

    #[error("Illegal phase transition {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

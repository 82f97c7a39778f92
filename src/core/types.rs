// src/core/types.rs — Core domain types

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::pareto::RankedFront;
use crate::infra::errors::{EngineError, RunnerError, ValidationError};

/// Identifier assigned by a runner to a submitted task.
pub type TaskId = String;

/// A single parameter value in a configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

/// Stable identity of a configuration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigId(String);

impl ConfigId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConfigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One candidate experiment: an immutable mapping of named parameters.
///
/// The id is the content hash of the parameters unless one was assigned
/// explicitly, so two configurations with the same parameters deduplicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    id: ConfigId,
    params: BTreeMap<String, ParamValue>,
}

impl Configuration {
    pub fn new(params: BTreeMap<String, ParamValue>) -> Result<Self, ValidationError> {
        validate_params(&params)?;
        let id = content_hash(&params);
        Ok(Self { id, params })
    }

    pub fn with_id(
        id: impl Into<String>,
        params: BTreeMap<String, ParamValue>,
    ) -> Result<Self, ValidationError> {
        validate_params(&params)?;
        Ok(Self {
            id: ConfigId::new(id),
            params,
        })
    }

    /// Build from `(name, value)` pairs.
    pub fn from_pairs<K, V, I>(pairs: I) -> Result<Self, ValidationError>
    where
        K: Into<String>,
        V: Into<ParamValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self::new(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn id(&self) -> &ConfigId {
        &self.id
    }

    pub fn params(&self) -> &BTreeMap<String, ParamValue> {
        &self.params
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.params.get(name)
    }

    /// Re-check the invariants of a configuration that came from outside
    /// (a planner or a checkpoint file).
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_params(&self.params)
    }
}

fn validate_params(params: &BTreeMap<String, ParamValue>) -> Result<(), ValidationError> {
    if params.is_empty() {
        return Err(ValidationError::EmptyConfiguration);
    }
    for (name, value) in params {
        if let ParamValue::Float(f) = value {
            if !f.is_finite() {
                return Err(ValidationError::NonFiniteParameter { name: name.clone() });
            }
        }
    }
    Ok(())
}

fn content_hash(params: &BTreeMap<String, ParamValue>) -> ConfigId {
    // BTreeMap serializes in key order, so the encoding is canonical.
    let encoded = serde_json::to_string(params).unwrap_or_default();
    let digest = Sha256::digest(encoded.as_bytes());
    ConfigId(format!("cfg-{}", &hex::encode(digest)[..16]))
}

/// Terminal status of one experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl ExperimentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "timed_out" => Some(Self::TimedOut),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an experiment did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    RunnerUnavailable,
    RunnerRejected,
    Timeout,
    RunnerInternalError,
    /// The runner reported success but the objectives were unusable.
    InvalidOutput,
    Cancelled,
}

impl From<&RunnerError> for FailureKind {
    fn from(e: &RunnerError) -> Self {
        match e {
            RunnerError::Unavailable { .. } => Self::RunnerUnavailable,
            RunnerError::Rejected { .. } => Self::RunnerRejected,
            RunnerError::Timeout { .. } => Self::Timeout,
            RunnerError::Internal { .. } => Self::RunnerInternalError,
            RunnerError::Cancelled => Self::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: FailureKind,
    pub message: String,
}

/// Outcome of running one configuration. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentResult {
    pub id: String,
    pub cycle: u32,
    pub configuration: Configuration,
    pub objectives: BTreeMap<String, f64>,
    pub status: ExperimentStatus,
    pub error: Option<ErrorDetail>,
    pub attempts: u32,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl ExperimentResult {
    pub fn succeeded(
        cycle: u32,
        configuration: Configuration,
        objectives: BTreeMap<String, f64>,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            cycle,
            configuration,
            objectives,
            status: ExperimentStatus::Succeeded,
            error: None,
            attempts: 1,
            submitted_at,
            completed_at: Utc::now(),
        }
    }

    /// A result that carries no objectives, built from a runner failure.
    pub fn from_error(
        cycle: u32,
        configuration: Configuration,
        error: &RunnerError,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        let kind = FailureKind::from(error);
        let status = match kind {
            FailureKind::Timeout => ExperimentStatus::TimedOut,
            FailureKind::Cancelled => ExperimentStatus::Cancelled,
            _ => ExperimentStatus::Failed,
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            cycle,
            configuration,
            objectives: BTreeMap::new(),
            status,
            error: Some(ErrorDetail {
                kind,
                message: error.to_string(),
            }),
            attempts: 1,
            submitted_at,
            completed_at: Utc::now(),
        }
    }

    pub fn config_id(&self) -> &ConfigId {
        self.configuration.id()
    }

    pub fn is_succeeded(&self) -> bool {
        self.status == ExperimentStatus::Succeeded
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// Demote a succeeded result whose objectives cannot be scored.
    pub fn into_invalid_output(mut self, message: impl Into<String>) -> Self {
        self.status = ExperimentStatus::Failed;
        self.error = Some(ErrorDetail {
            kind: FailureKind::InvalidOutput,
            message: message.into(),
        });
        self
    }
}

/// Structured statistics attached to an insight.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InsightStats {
    pub results_total: usize,
    pub results_succeeded: usize,
    pub front_size: usize,
    pub strata: usize,
    /// How many other succeeded results each front member dominates.
    pub dominance_counts: BTreeMap<String, usize>,
    /// Change of the best value per objective versus earlier cycles
    /// (oriented so that positive means improvement).
    pub trend_deltas: BTreeMap<String, f64>,
}

/// Derived summary attached to a cycle. Immutable, appended after analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub id: String,
    pub cycle: u32,
    pub source: String,
    pub summary: String,
    pub stats: InsightStats,
    pub created_at: DateTime<Utc>,
}

impl Insight {
    pub fn new(
        cycle: u32,
        source: impl Into<String>,
        summary: impl Into<String>,
        stats: InsightStats,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            cycle,
            source: source.into(),
            summary: summary.into(),
            stats,
            created_at: Utc::now(),
        }
    }
}

/// Phase of the cycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    Reviewing,
    Executing,
    PersistingResults,
    Analyzing,
    PersistingInsights,
    Deciding,
    Terminated,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Reviewing => "reviewing",
            Self::Executing => "executing",
            Self::PersistingResults => "persisting_results",
            Self::Analyzing => "analyzing",
            Self::PersistingInsights => "persisting_insights",
            Self::Deciding => "deciding",
            Self::Terminated => "terminated",
        }
    }

    /// Legal successors. Any phase may terminate; only `Reviewing` may loop
    /// back to `Planning` inside a cycle, and only `Deciding` may start the
    /// next one.
    pub fn can_transition_to(&self, next: Phase) -> bool {
        use Phase::*;
        if next == Terminated {
            return *self != Terminated;
        }
        matches!(
            (self, next),
            (Planning, Reviewing)
                | (Planning, Deciding)
                | (Reviewing, Planning)
                | (Reviewing, Executing)
                | (Executing, PersistingResults)
                | (PersistingResults, Analyzing)
                | (Analyzing, PersistingInsights)
                | (PersistingInsights, Deciding)
                | (Deciding, Planning)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum TerminalReason {
    BudgetExhausted,
    CycleLimitReached,
    ReviewRetryExhausted { attempts: u32, feedback: String },
    PersistenceFailed { message: String },
    InvalidState { message: String },
    Cancelled,
}

impl TerminalReason {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ReviewRetryExhausted { .. }
                | Self::PersistenceFailed { .. }
                | Self::InvalidState { .. }
        )
    }
}

impl fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BudgetExhausted => write!(f, "budget exhausted"),
            Self::CycleLimitReached => write!(f, "cycle limit reached"),
            Self::ReviewRetryExhausted { attempts, feedback } => write!(
                f,
                "review retry exhausted after {attempts} attempt(s): {feedback}"
            ),
            Self::PersistenceFailed { message } => write!(f, "persistence failed: {message}"),
            Self::InvalidState { message } => write!(f, "invalid state: {message}"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// An experiment handed to the coordinator whose outcome is not yet known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutstandingTask {
    pub config_id: ConfigId,
    pub task_id: Option<TaskId>,
    pub retries: u32,
}

/// Run-time record owned by the cycle state machine, persisted after every
/// phase transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleState {
    pub run_id: String,
    pub cycle: u32,
    pub phase: Phase,
    pub budget_total: u32,
    pub budget_consumed: u32,
    pub budget_remaining: u32,
    pub review_retries: u32,
    pub feedback: Option<String>,
    /// Configurations planned (and, past `Reviewing`, approved) this cycle.
    pub batch: Vec<Configuration>,
    pub outstanding: Vec<OutstandingTask>,
    /// Results collected this cycle, not yet charged against the budget.
    pub completed: Vec<ExperimentResult>,
    pub pending_insights: Vec<Insight>,
    pub pending_fronts: Vec<RankedFront>,
    pub terminal: Option<TerminalReason>,
    /// Phase the run was in when it terminated.
    #[serde(default)]
    pub stopped_in: Option<Phase>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CycleState {
    pub fn new(budget_total: u32) -> Self {
        let now = Utc::now();
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            cycle: 1,
            phase: Phase::Planning,
            budget_total,
            budget_consumed: 0,
            budget_remaining: budget_total,
            review_retries: 0,
            feedback: None,
            batch: Vec::new(),
            outstanding: Vec::new(),
            completed: Vec::new(),
            pending_insights: Vec::new(),
            pending_fronts: Vec::new(),
            terminal: None,
            stopped_in: None,
            started_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, rejecting transitions the state machine never makes.
    pub fn advance(&mut self, next: Phase) -> Result<(), EngineError> {
        if !self.phase.can_transition_to(next) {
            return Err(EngineError::IllegalTransition {
                from: self.phase.to_string(),
                to: next.to_string(),
            });
        }
        self.phase = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn terminate(&mut self, reason: TerminalReason) {
        if self.phase != Phase::Terminated {
            self.stopped_in = Some(self.phase);
        }
        self.phase = Phase::Terminated;
        self.terminal = Some(reason);
        self.updated_at = Utc::now();
    }

    /// Charge `units` against the budget. Never exceeds the allocation.
    pub fn charge(&mut self, units: u32) {
        self.budget_consumed = (self.budget_consumed + units).min(self.budget_total);
        self.budget_remaining = self.budget_total - self.budget_consumed;
    }

    pub fn is_terminated(&self) -> bool {
        self.phase == Phase::Terminated
    }

    /// Reset the per-cycle fields and step to the next cycle.
    pub fn begin_next_cycle(&mut self) {
        self.cycle += 1;
        self.review_retries = 0;
        self.feedback = None;
        self.batch.clear();
        self.outstanding.clear();
        self.completed.clear();
        self.pending_insights.clear();
        self.pending_fronts.clear();
    }
}

// src/core/engine.rs — Cycle state machine
//
// Drives plan -> review -> execute -> persist -> analyze -> persist -> decide
// until the budget or the cycle limit runs out. The CycleState is committed
// to the StateStore after every phase transition, so a restarted engine
// picks up from the last committed phase.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::bus::{EngineEvent, EventBus};
use super::checkpoint::{RunHistoryEntry, StateStore};
use super::coordinator::{BatchUpdate, ExecutionCoordinator};
use super::pareto::{self, RankedFront};
use super::types::*;
use crate::agents::{AnalysisInput, Analyzer, PlanRequest, Planner, Reviewer};
use crate::infra::config::Config;
use crate::infra::errors::{CollaboratorError, EngineError, StoreError, ValidationError};
use crate::memory::{FrontSnapshot, ObjectiveStore, ResultFilter};
use crate::runner::Runner;

const SENDER: &str = "cycle-engine";

/// The external collaborators the engine consults each cycle.
pub struct Collaborators {
    pub planner: Arc<dyn Planner>,
    pub reviewer: Arc<dyn Reviewer>,
    pub analyzer: Arc<dyn Analyzer>,
}

/// What a finished run hands back to the caller.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Phase the run was in when it stopped.
    pub stopped_in: Phase,
    pub reason: TerminalReason,
    /// Last committed state.
    pub state: CycleState,
    /// Latest front snapshot per stratum.
    pub fronts: Vec<FrontSnapshot>,
}

impl RunReport {
    pub fn is_fatal(&self) -> bool {
        self.reason.is_fatal()
    }
}

/// Why a phase handler stopped the loop.
#[derive(Debug)]
enum Halt {
    Cancelled,
    Stop(TerminalReason),
}

impl From<EngineError> for Halt {
    fn from(e: EngineError) -> Self {
        Halt::Stop(TerminalReason::InvalidState {
            message: e.to_string(),
        })
    }
}

impl From<ValidationError> for Halt {
    fn from(e: ValidationError) -> Self {
        Halt::Stop(TerminalReason::InvalidState {
            message: e.to_string(),
        })
    }
}

fn persistence(e: StoreError) -> Halt {
    Halt::Stop(TerminalReason::PersistenceFailed {
        message: e.to_string(),
    })
}

pub struct CycleEngine {
    config: Config,
    planner: Arc<dyn Planner>,
    reviewer: Arc<dyn Reviewer>,
    analyzer: Arc<dyn Analyzer>,
    coordinator: Arc<ExecutionCoordinator>,
    store: Arc<dyn ObjectiveStore>,
    checkpoint: Arc<dyn StateStore>,
    bus: Arc<EventBus>,
    cancel: CancellationToken,
}

impl CycleEngine {
    pub fn new(
        config: Config,
        collaborators: Collaborators,
        runner: Arc<dyn Runner>,
        store: Arc<dyn ObjectiveStore>,
        checkpoint: Arc<dyn StateStore>,
        bus: Arc<EventBus>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let cancel = CancellationToken::new();
        let coordinator = Arc::new(ExecutionCoordinator::new(
            runner,
            &config.execution,
            cancel.clone(),
        ));
        Ok(Self {
            config,
            planner: collaborators.planner,
            reviewer: collaborators.reviewer,
            analyzer: collaborators.analyzer,
            coordinator,
            store,
            checkpoint,
            bus,
            cancel,
        })
    }

    /// Token that aborts the run from any phase when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn coordinator(&self) -> &ExecutionCoordinator {
        &self.coordinator
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Run cycles until the run terminates, resuming from the checkpoint
    /// when one is left over from an interrupted run.
    pub async fn run(&self) -> Result<RunReport, EngineError> {
        let mut state = self.initial_state()?;

        while !state.is_terminated() {
            if self.cancel.is_cancelled() {
                self.halt(&mut state, TerminalReason::Cancelled);
                break;
            }
            match self.step(&mut state).await {
                Ok(()) => {}
                Err(Halt::Cancelled) => self.halt(&mut state, TerminalReason::Cancelled),
                Err(Halt::Stop(reason)) => self.halt(&mut state, reason),
            }
        }

        self.bus.flush().await;

        let fronts = self.store.latest_fronts(None).unwrap_or_else(|e| {
            warn!("Could not read front snapshots: {e}");
            Vec::new()
        });
        let reason = state
            .terminal
            .clone()
            .unwrap_or(TerminalReason::InvalidState {
                message: "terminated without a reason".into(),
            });
        Ok(RunReport {
            stopped_in: state.stopped_in.unwrap_or(Phase::Terminated),
            reason,
            state,
            fronts,
        })
    }

    fn initial_state(&self) -> Result<CycleState, EngineError> {
        if let Some(state) = self.checkpoint.load()? {
            if !state.is_terminated() {
                for config in &state.batch {
                    config.validate()?;
                }
                info!(
                    run_id = %state.run_id,
                    cycle = state.cycle,
                    phase = %state.phase,
                    "Resuming run from checkpoint"
                );
                return Ok(state);
            }
        }

        let state = CycleState::new(self.config.experiment.budget);
        info!(
            run_id = %state.run_id,
            budget = state.budget_total,
            max_cycles = self.config.experiment.max_cycles,
            "Starting new run"
        );
        self.checkpoint.save(&state)?;
        Ok(state)
    }

    async fn step(&self, state: &mut CycleState) -> Result<(), Halt> {
        match state.phase {
            Phase::Planning => self.plan(state).await,
            Phase::Reviewing => self.review(state).await,
            Phase::Executing => self.execute(state).await,
            Phase::PersistingResults => self.persist_results(state),
            Phase::Analyzing => self.analyze(state).await,
            Phase::PersistingInsights => self.persist_insights(state),
            Phase::Deciding => self.decide(state),
            Phase::Terminated => Ok(()),
        }
    }

    // -- Phases --

    async fn plan(&self, state: &mut CycleState) -> Result<(), Halt> {
        let cycle = state.cycle;
        let limit = self.config.experiment.batch_size.min(state.budget_remaining);
        if limit == 0 {
            state.batch.clear();
            return self.transition(state, Phase::Deciding);
        }

        let history = self
            .store
            .query_results(&ResultFilter::all())
            .map_err(persistence)?;
        let request = PlanRequest {
            cycle,
            history: &history,
            feedback: state.feedback.as_deref(),
            budget_remaining: limit,
        };
        let proposed = match self
            .consult(self.planner.name(), self.planner.plan(request))
            .await?
        {
            Ok(configs) => configs,
            Err(e) => {
                warn!(cycle, "Planner failed, continuing with an empty plan: {e}");
                Vec::new()
            }
        };

        let batch = admit(proposed, &history, limit as usize);
        self.publish(EngineEvent::PlanProposed {
            cycle,
            attempt: state.review_retries + 1,
            config_ids: batch.iter().map(|c| c.id().clone()).collect(),
        });

        if batch.is_empty() {
            info!(cycle, "Empty plan");
            state.batch.clear();
            return self.transition(state, Phase::Deciding);
        }
        debug!(cycle, size = batch.len(), "Plan proposed");
        state.batch = batch;
        self.transition(state, Phase::Reviewing)
    }

    async fn review(&self, state: &mut CycleState) -> Result<(), Halt> {
        let cycle = state.cycle;
        let mut rejections = Vec::new();
        for config in &state.batch {
            match self
                .consult(self.reviewer.name(), self.reviewer.review(config))
                .await?
            {
                Ok(verdict) if verdict.approved => {}
                Ok(verdict) if verdict.feedback.is_empty() => {
                    rejections.push(format!("{} rejected", config.id()));
                }
                Ok(verdict) => rejections.push(verdict.feedback),
                Err(e) => {
                    warn!(cycle, config_id = %config.id(), "Review skipped, approving: {e}");
                }
            }
        }

        let attempt = state.review_retries + 1;
        if rejections.is_empty() {
            state.feedback = None;
            state.outstanding = state
                .batch
                .iter()
                .map(|c| OutstandingTask {
                    config_id: c.id().clone(),
                    task_id: None,
                    retries: 0,
                })
                .collect();
            self.publish(EngineEvent::PlanApproved {
                cycle,
                size: state.batch.len(),
            });
            return self.transition(state, Phase::Executing);
        }

        let feedback = rejections.join("\n");
        state.review_retries += 1;
        warn!(cycle, attempt, rejected = rejections.len(), "Plan rejected");
        self.publish(EngineEvent::PlanRejected {
            cycle,
            attempt,
            feedback: feedback.clone(),
        });

        if state.review_retries > self.config.review.max_retries {
            return Err(Halt::Stop(TerminalReason::ReviewRetryExhausted {
                attempts: state.review_retries,
                feedback,
            }));
        }
        state.feedback = Some(feedback);
        state.batch.clear();
        self.transition(state, Phase::Planning)
    }

    async fn execute(&self, state: &mut CycleState) -> Result<(), Halt> {
        let cycle = state.cycle;
        self.coordinator.forget_before(cycle);

        // Results this run already stored for the batch count as complete.
        let stored = self
            .store
            .query_results(&ResultFilter::all().cycle(cycle))
            .map_err(persistence)?;
        for result in stored {
            let planned = state.batch.iter().any(|c| c.id() == result.config_id());
            let known = state
                .completed
                .iter()
                .any(|r| r.config_id() == result.config_id());
            if planned && !known && result.submitted_at >= state.started_at {
                state.completed.push(result);
            }
        }

        let done: HashSet<ConfigId> = state
            .completed
            .iter()
            .map(|r| r.config_id().clone())
            .collect();
        for result in state.completed.iter().filter(|r| r.is_succeeded()) {
            self.coordinator.remember(result);
        }
        let pending: Vec<Configuration> = state
            .batch
            .iter()
            .filter(|c| !done.contains(c.id()))
            .cloned()
            .collect();
        state.outstanding.retain(|t| !done.contains(&t.config_id));
        for config in &pending {
            if !state.outstanding.iter().any(|t| &t.config_id == config.id()) {
                state.outstanding.push(OutstandingTask {
                    config_id: config.id().clone(),
                    task_id: None,
                    retries: 0,
                });
            }
        }
        if !done.is_empty() {
            info!(cycle, skipped = done.len(), pending = pending.len(), "Resuming batch");
        }

        if !pending.is_empty() {
            let mut updates = self.coordinator.run_batch(
                cycle,
                pending,
                self.config.execution.retry.clone(),
                self.config.execution.task_timeout(),
            );
            while let Some(update) = updates.recv().await {
                self.apply_update(state, update);
            }
        }

        if self.cancel.is_cancelled() {
            self.salvage(state);
            return Err(Halt::Cancelled);
        }
        self.transition(state, Phase::PersistingResults)
    }

    fn apply_update(&self, state: &mut CycleState, update: BatchUpdate) {
        let cycle = state.cycle;
        match update {
            BatchUpdate::Submitted {
                config_id,
                task_id,
                attempt,
            } => {
                if let Some(task) = state.outstanding.iter_mut().find(|t| t.config_id == config_id) {
                    task.task_id = task_id;
                    task.retries = attempt.saturating_sub(1);
                }
                self.publish(EngineEvent::ExperimentSubmitted { cycle, config_id });
                self.save_progress(state);
            }
            BatchUpdate::Retrying {
                config_id,
                attempt,
                reason,
                ..
            } => {
                if let Some(task) = state.outstanding.iter_mut().find(|t| t.config_id == config_id) {
                    task.retries = attempt;
                }
                self.publish(EngineEvent::ExperimentRetrying {
                    cycle,
                    config_id,
                    attempt,
                    reason,
                });
            }
            BatchUpdate::Finished { result } => {
                let result = self.check_output(result);
                state
                    .outstanding
                    .retain(|t| &t.config_id != result.config_id());
                info!(
                    cycle,
                    config_id = %result.config_id(),
                    status = %result.status,
                    attempts = result.attempts,
                    "Experiment finished"
                );
                self.publish(EngineEvent::ExperimentCompleted {
                    cycle,
                    config_id: result.config_id().clone(),
                    status: result.status,
                    objectives: result.objectives.clone(),
                });
                state.completed.push(result);
                self.save_progress(state);
            }
        }
    }

    /// Demote a succeeded result that lacks a usable value for any objective.
    fn check_output(&self, result: ExperimentResult) -> ExperimentResult {
        if !result.is_succeeded() {
            return result;
        }
        let missing: Vec<&str> = self
            .config
            .pareto
            .objectives
            .iter()
            .filter(|o| !result.objectives.get(&o.name).is_some_and(|v| v.is_finite()))
            .map(|o| o.name.as_str())
            .collect();
        if missing.is_empty() {
            return result;
        }
        let message = format!("missing or non-finite objectives: {}", missing.join(", "));
        warn!(config_id = %result.config_id(), "Runner output rejected: {message}");
        result.into_invalid_output(message)
    }

    /// Store the final outcomes of an interrupted batch and charge them
    /// the way `decide` would. Cancelled results are neither.
    fn salvage(&self, state: &mut CycleState) {
        let mut spent = 0;
        for result in state
            .completed
            .iter()
            .filter(|r| r.status != ExperimentStatus::Cancelled)
        {
            match self.store.append_result(result) {
                Ok(()) | Err(StoreError::Duplicate { .. }) => {
                    if self.chargeable(result) {
                        spent += 1;
                    }
                }
                Err(e) => warn!(config_id = %result.config_id(), "Result lost on cancel: {e}"),
            }
        }
        state.charge(spent);
    }

    /// Whether `result` counts against the budget.
    fn chargeable(&self, result: &ExperimentResult) -> bool {
        match result.status {
            ExperimentStatus::Succeeded => true,
            ExperimentStatus::Failed | ExperimentStatus::TimedOut => {
                self.config.experiment.charge_failed
            }
            ExperimentStatus::Cancelled => false,
        }
    }

    fn persist_results(&self, state: &mut CycleState) -> Result<(), Halt> {
        for result in &state.completed {
            match self.store.append_result(result) {
                Ok(()) => {}
                Err(StoreError::Duplicate { .. }) => {
                    debug!(result_id = %result.id, "Result already stored");
                }
                Err(e) => {
                    error!(cycle = state.cycle, result_id = %result.id, "Result write failed: {e}");
                    return Err(persistence(e));
                }
            }
        }
        self.transition(state, Phase::Analyzing)
    }

    async fn analyze(&self, state: &mut CycleState) -> Result<(), Halt> {
        let cycle = state.cycle;
        let history = self
            .store
            .query_results(&ResultFilter::all())
            .map_err(persistence)?;

        let fronts = self.rank_fronts(&history)?;
        for front in &fronts {
            self.publish(EngineEvent::FrontUpdated {
                cycle,
                stratum: front.stratum.clone(),
                size: front.members.len(),
            });
        }

        let input = AnalysisInput {
            cycle,
            objectives: self.config.pareto.objectives.clone(),
            history,
            fronts: fronts.clone(),
        };
        let insights = match self
            .consult(self.analyzer.name(), self.analyzer.analyze(&input))
            .await?
        {
            Ok(insights) => insights,
            Err(e) => {
                warn!(cycle, "Analyzer failed, no insights this cycle: {e}");
                Vec::new()
            }
        };

        state.pending_fronts = fronts;
        state.pending_insights = insights;
        self.transition(state, Phase::PersistingInsights)
    }

    /// Ranked, top-K fronts over every succeeded result, one per stratum.
    fn rank_fronts(&self, history: &[ExperimentResult]) -> Result<Vec<RankedFront>, ValidationError> {
        let cfg = &self.config.pareto;
        let succeeded: Vec<ExperimentResult> =
            history.iter().filter(|r| r.is_succeeded()).cloned().collect();

        let fronts: Vec<pareto::ParetoFront> = match &cfg.strata_key {
            Some(key) => {
                let (keyed, unkeyed): (Vec<_>, Vec<_>) = succeeded
                    .into_iter()
                    .partition(|r| r.configuration.get(key).is_some());
                if !unkeyed.is_empty() {
                    warn!(key = %key, count = unkeyed.len(), "Results without the stratum key left out of fronts");
                }
                pareto::stratify(&keyed, &cfg.objectives, key)?
                    .into_values()
                    .collect()
            }
            None => vec![pareto::compute_front(&succeeded, &cfg.objectives)?],
        };

        fronts
            .iter()
            .filter(|f| !f.members.is_empty())
            .map(|f| pareto::retain_top_k(f, cfg.top_k, &cfg.objectives, &cfg.ranking))
            .collect()
    }

    fn persist_insights(&self, state: &mut CycleState) -> Result<(), Halt> {
        let cycle = state.cycle;
        for insight in &state.pending_insights {
            match self.store.append_insight(insight) {
                Ok(()) => self.publish(EngineEvent::InsightGenerated {
                    cycle,
                    summary: insight.summary.clone(),
                }),
                Err(StoreError::Duplicate { .. }) => {}
                Err(e) => warn!(cycle, insight_id = %insight.id, "Insight not persisted: {e}"),
            }
        }
        for front in &state.pending_fronts {
            match self.store.append_front_snapshot(cycle, front) {
                Ok(()) | Err(StoreError::Duplicate { .. }) => {}
                Err(e) => warn!(cycle, stratum = ?front.stratum, "Front snapshot not persisted: {e}"),
            }
        }
        state.pending_insights.clear();
        state.pending_fronts.clear();
        self.transition(state, Phase::Deciding)
    }

    fn decide(&self, state: &mut CycleState) -> Result<(), Halt> {
        let spent = state
            .completed
            .iter()
            .filter(|r| self.chargeable(r))
            .count() as u32;
        state.charge(spent);
        info!(
            cycle = state.cycle,
            spent,
            consumed = state.budget_consumed,
            remaining = state.budget_remaining,
            "Cycle complete"
        );

        if state.budget_remaining == 0 {
            return Err(Halt::Stop(TerminalReason::BudgetExhausted));
        }
        if state.cycle >= self.config.experiment.max_cycles {
            return Err(Halt::Stop(TerminalReason::CycleLimitReached));
        }
        state.begin_next_cycle();
        self.transition(state, Phase::Planning)
    }

    // -- Plumbing --

    /// Advance, commit, then announce.
    fn transition(&self, state: &mut CycleState, next: Phase) -> Result<(), Halt> {
        let from = state.phase;
        state.advance(next)?;
        self.checkpoint.save(state).map_err(persistence)?;
        info!(cycle = state.cycle, "Phase {from} -> {next}");
        self.publish(EngineEvent::PhaseChanged {
            cycle: state.cycle,
            from,
            to: next,
        });
        Ok(())
    }

    fn halt(&self, state: &mut CycleState, reason: TerminalReason) {
        let from = state.phase;
        state.terminate(reason.clone());
        if reason.is_fatal() {
            error!(cycle = state.cycle, phase = %from, "Run terminated: {reason}");
        } else {
            info!(cycle = state.cycle, phase = %from, "Run finished: {reason}");
        }

        if let Err(e) = self.checkpoint.save(state) {
            error!("Final state not saved: {e}");
        }
        if let Err(e) = self.checkpoint.record_run(&RunHistoryEntry::from_state(state)) {
            warn!("Run history not written: {e}");
        }
        self.publish(EngineEvent::PhaseChanged {
            cycle: state.cycle,
            from,
            to: Phase::Terminated,
        });
        self.publish(EngineEvent::RunTerminated {
            cycle: state.cycle,
            reason,
            budget_consumed: state.budget_consumed,
            budget_total: state.budget_total,
        });
    }

    fn save_progress(&self, state: &mut CycleState) {
        state.updated_at = Utc::now();
        if let Err(e) = self.checkpoint.save(state) {
            warn!(cycle = state.cycle, "Checkpoint not saved: {e}");
        }
    }

    fn publish(&self, payload: EngineEvent) {
        self.bus.publish(SENDER, payload);
    }

    /// Call a collaborator under the collaborator timeout, giving up early
    /// when the run is cancelled.
    async fn consult<T>(
        &self,
        collaborator: &str,
        call: impl Future<Output = Result<T, CollaboratorError>>,
    ) -> Result<Result<T, CollaboratorError>, Halt> {
        let after = Duration::from_secs(self.config.collaborators.timeout_secs);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Halt::Cancelled),
            outcome = tokio::time::timeout(after, call) => Ok(outcome.unwrap_or_else(|_| {
                Err(CollaboratorError::Timeout {
                    collaborator: collaborator.to_string(),
                    after,
                })
            })),
        }
    }
}

/// Keep at most `limit` valid, distinct configurations that have not
/// already succeeded.
fn admit(
    proposed: Vec<Configuration>,
    history: &[ExperimentResult],
    limit: usize,
) -> Vec<Configuration> {
    let succeeded: HashSet<&ConfigId> = history
        .iter()
        .filter(|r| r.is_succeeded())
        .map(|r| r.config_id())
        .collect();
    let mut seen = HashSet::new();
    let mut batch = Vec::new();
    for config in proposed {
        if batch.len() == limit {
            break;
        }
        if let Err(e) = config.validate() {
            warn!(config_id = %config.id(), "Dropping invalid configuration: {e}");
            continue;
        }
        if succeeded.contains(config.id()) {
            debug!(config_id = %config.id(), "Already executed, skipping");
            continue;
        }
        if seen.insert(config.id().clone()) {
            batch.push(config);
        }
    }
    batch
}

// src/core/coordinator.rs — Concurrent experiment execution against a runner
//
// `submit` waits for a slot under the concurrency ceiling (backpressure),
// `await_result` polls the runner until the task finishes, times out, or
// the run is cancelled. Neither retries. `run_batch` fans a batch out to
// one task per configuration and streams results back as they land,
// applying the caller's `RetryPolicy` between attempts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use super::retry::RetryPolicy;
use super::types::{ConfigId, Configuration, ExperimentResult, TaskId};
use crate::infra::config::ExecutionConfig;
use crate::infra::errors::RunnerError;
use crate::runner::{Runner, TaskState};

/// Occupies one concurrency slot until dropped.
struct Slot {
    _permit: OwnedSemaphorePermit,
    outstanding: Arc<AtomicUsize>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A submitted experiment. Holds its concurrency slot until resolved.
pub struct TaskHandle {
    cycle: u32,
    config: Configuration,
    task_id: Option<TaskId>,
    submitted_at: DateTime<Utc>,
    cached: Option<ExperimentResult>,
    _slot: Option<Slot>,
}

impl TaskHandle {
    pub fn task_id(&self) -> Option<&TaskId> {
        self.task_id.as_ref()
    }

    pub fn config_id(&self) -> &ConfigId {
        self.config.id()
    }

    /// True when the configuration already succeeded this cycle and no
    /// runner task was started.
    pub fn is_cached(&self) -> bool {
        self.cached.is_some()
    }
}

/// Progress of one configuration inside `run_batch`.
#[derive(Debug, Clone)]
pub enum BatchUpdate {
    Submitted {
        config_id: ConfigId,
        task_id: Option<TaskId>,
        attempt: u32,
    },
    Retrying {
        config_id: ConfigId,
        attempt: u32,
        delay: Duration,
        reason: String,
    },
    Finished {
        result: ExperimentResult,
    },
}

pub struct ExecutionCoordinator {
    runner: Arc<dyn Runner>,
    slots: Arc<Semaphore>,
    concurrency: usize,
    poll_interval: Duration,
    outstanding: Arc<AtomicUsize>,
    peak: AtomicUsize,
    succeeded: Mutex<HashMap<(u32, ConfigId), ExperimentResult>>,
    cancel: CancellationToken,
}

impl ExecutionCoordinator {
    pub fn new(runner: Arc<dyn Runner>, config: &ExecutionConfig, cancel: CancellationToken) -> Self {
        let concurrency = config.concurrency.max(1);
        Self {
            runner,
            slots: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            poll_interval: config.poll_interval(),
            outstanding: Arc::new(AtomicUsize::new(0)),
            peak: AtomicUsize::new(0),
            succeeded: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    pub fn runner_id(&self) -> &str {
        self.runner.id()
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Tasks currently holding a slot.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously outstanding tasks seen so far.
    pub fn peak_outstanding(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Cancel every outstanding and future task.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Seed the succeeded cache, e.g. from results recovered after a crash.
    pub fn remember(&self, result: &ExperimentResult) {
        if result.is_succeeded() {
            if let Ok(mut cache) = self.succeeded.lock() {
                cache.insert((result.cycle, result.config_id().clone()), result.clone());
            }
        }
    }

    /// Drop cached successes of cycles before `cycle`. They can never
    /// short-circuit again once a later cycle has started.
    pub fn forget_before(&self, cycle: u32) {
        if let Ok(mut cache) = self.succeeded.lock() {
            cache.retain(|(c, _), _| *c >= cycle);
        }
    }

    /// Successes currently held for short-circuiting.
    pub fn cached_len(&self) -> usize {
        self.succeeded.lock().map(|c| c.len()).unwrap_or(0)
    }

    fn cached(&self, cycle: u32, id: &ConfigId) -> Option<ExperimentResult> {
        self.succeeded
            .lock()
            .ok()
            .and_then(|c| c.get(&(cycle, id.clone())).cloned())
    }

    /// Start `config` on the runner, waiting for a free slot first.
    ///
    /// A configuration that already succeeded in `cycle` is short-circuited:
    /// the handle resolves to the cached result and the runner is not called.
    pub async fn submit(&self, cycle: u32, config: &Configuration) -> Result<TaskHandle, RunnerError> {
        if let Some(result) = self.cached(cycle, config.id()) {
            tracing::debug!(cycle, config_id = %config.id(), "Already succeeded this cycle; reusing result");
            return Ok(TaskHandle {
                cycle,
                config: config.clone(),
                task_id: None,
                submitted_at: result.submitted_at,
                cached: Some(result),
                _slot: None,
            });
        }

        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(RunnerError::Cancelled),
            permit = self.slots.clone().acquire_owned() => {
                permit.map_err(|_| RunnerError::Cancelled)?
            }
        };
        let now = self.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let slot = Slot {
            _permit: permit,
            outstanding: self.outstanding.clone(),
        };

        let submitted_at = Utc::now();
        let task_id = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(RunnerError::Cancelled),
            r = self.runner.submit(config) => r?,
        };
        tracing::debug!(cycle, config_id = %config.id(), task = %task_id, "Experiment submitted");

        Ok(TaskHandle {
            cycle,
            config: config.clone(),
            task_id: Some(task_id),
            submitted_at,
            cached: None,
            _slot: Some(slot),
        })
    }

    /// Wait for `handle` to resolve. Always yields a result: runner failures,
    /// the timeout and cancellation become non-succeeded results.
    pub async fn await_result(&self, handle: TaskHandle, timeout: Duration) -> ExperimentResult {
        let TaskHandle {
            cycle,
            config,
            task_id,
            submitted_at,
            cached,
            _slot,
        } = handle;

        if let Some(result) = cached {
            return result;
        }
        let Some(task_id) = task_id else {
            let err = RunnerError::Internal {
                runner: self.runner.id().to_string(),
                message: "handle has no task".into(),
            };
            return ExperimentResult::from_error(cycle, config, &err, submitted_at);
        };

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RunnerError::Cancelled),
            r = tokio::time::timeout(timeout, self.wait_for(&task_id)) => match r {
                Ok(inner) => inner,
                Err(_) => Err(RunnerError::Timeout { after: timeout }),
            },
        };

        let result = match outcome {
            Ok(objectives) => {
                ExperimentResult::succeeded(cycle, config, objectives, submitted_at)
            }
            Err(err) => {
                if matches!(err, RunnerError::Timeout { .. } | RunnerError::Cancelled) {
                    if let Err(e) = self.runner.cancel(&task_id).await {
                        tracing::debug!(task = %task_id, "Runner cancel failed: {e}");
                    }
                }
                tracing::warn!(cycle, config_id = %config.id(), task = %task_id, "Experiment did not succeed: {err}");
                ExperimentResult::from_error(cycle, config, &err, submitted_at)
            }
        };

        if result.is_succeeded() {
            self.remember(&result);
        }
        result
    }

    /// Poll until the task finishes, then fetch its objectives.
    async fn wait_for(
        &self,
        task_id: &TaskId,
    ) -> Result<std::collections::BTreeMap<String, f64>, RunnerError> {
        let state = loop {
            match self.runner.poll_status(task_id).await {
                Ok(status) if status.state.is_finished() => break status.state,
                Ok(_) => {}
                // Transient poll failures are absorbed; the timeout bounds them.
                Err(e) if e.is_retriable() => {
                    tracing::debug!(task = %task_id, "Poll failed, will retry: {e}");
                }
                Err(e) => return Err(e),
            }
            tokio::time::sleep(self.poll_interval).await;
        };

        match (state, self.runner.fetch_result(task_id).await) {
            (TaskState::Completed, Ok(output)) => {
                if let Some((name, _)) = output.objectives.iter().find(|(_, v)| !v.is_finite()) {
                    return Err(RunnerError::Internal {
                        runner: self.runner.id().to_string(),
                        message: format!("objective '{name}' is not a finite number"),
                    });
                }
                Ok(output.objectives)
            }
            (_, Err(e)) => Err(e),
            (_, Ok(_)) => Err(RunnerError::Internal {
                runner: self.runner.id().to_string(),
                message: "task reported failure".into(),
            }),
        }
    }

    /// Run one configuration to a final result, retrying per `policy`.
    async fn run_one(
        &self,
        cycle: u32,
        config: Configuration,
        policy: &RetryPolicy,
        timeout: Duration,
        updates: &mpsc::Sender<BatchUpdate>,
    ) -> ExperimentResult {
        let mut attempt = 1;
        loop {
            let submitted_at = Utc::now();
            let mut result = match self.submit(cycle, &config).await {
                Ok(handle) => {
                    let _ = updates
                        .send(BatchUpdate::Submitted {
                            config_id: config.id().clone(),
                            task_id: handle.task_id().cloned(),
                            attempt,
                        })
                        .await;
                    self.await_result(handle, timeout).await
                }
                Err(e) => ExperimentResult::from_error(cycle, config.clone(), &e, submitted_at),
            };
            result.attempts = attempt;

            let Some(kind) = result.failure_kind() else {
                return result;
            };
            if self.is_cancelled() || !policy.should_retry(kind, attempt) {
                return result;
            }

            let delay = policy.delay_for_attempt(attempt - 1);
            let reason = result
                .error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_default();
            tracing::info!(cycle, config_id = %config.id(), attempt, delay_ms = delay.as_millis() as u64, "Retrying experiment: {reason}");
            let _ = updates
                .send(BatchUpdate::Retrying {
                    config_id: config.id().clone(),
                    attempt,
                    delay,
                    reason,
                })
                .await;

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    let mut cancelled = ExperimentResult::from_error(
                        cycle,
                        config,
                        &RunnerError::Cancelled,
                        result.submitted_at,
                    );
                    cancelled.attempts = attempt;
                    return cancelled;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    /// Run every configuration concurrently (bounded by the ceiling) and
    /// stream updates as they happen. Exactly one `Finished` arrives per
    /// configuration; the channel closes once all have finished.
    pub fn run_batch(
        self: &Arc<Self>,
        cycle: u32,
        configs: Vec<Configuration>,
        policy: RetryPolicy,
        timeout: Duration,
    ) -> mpsc::Receiver<BatchUpdate> {
        let (tx, rx) = mpsc::channel(configs.len().max(1) * 4);
        let policy = Arc::new(policy);

        for config in configs {
            let this = self.clone();
            let tx = tx.clone();
            let policy = policy.clone();
            tokio::spawn(async move {
                let result = this.run_one(cycle, config, &policy, timeout, &tx).await;
                let _ = tx.send(BatchUpdate::Finished { result }).await;
            });
        }

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ExperimentStatus, ParamValue};
    use crate::runner::{RunOutput, TaskStatus};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    /// Finishes every task after `delay`, failing `submit` for the first
    /// `flaky` calls.
    struct Scripted {
        delay: Duration,
        flaky: AtomicU32,
        submits: AtomicU32,
        started: Mutex<HashMap<TaskId, tokio::time::Instant>>,
        cancelled: Mutex<Vec<TaskId>>,
    }

    impl Scripted {
        fn new(delay: Duration, flaky: u32) -> Self {
            Self {
                delay,
                flaky: AtomicU32::new(flaky),
                submits: AtomicU32::new(0),
                started: Mutex::new(HashMap::new()),
                cancelled: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Runner for Scripted {
        fn id(&self) -> &str {
            "scripted"
        }

        async fn submit(&self, _config: &Configuration) -> Result<TaskId, RunnerError> {
            let n = self.submits.fetch_add(1, Ordering::SeqCst);
            if self
                .flaky
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| f.checked_sub(1))
                .is_ok()
            {
                return Err(RunnerError::Unavailable {
                    runner: "scripted".into(),
                    message: "connection refused".into(),
                });
            }
            let id = format!("t{n}");
            self.started
                .lock()
                .unwrap()
                .insert(id.clone(), tokio::time::Instant::now());
            Ok(id)
        }

        async fn poll_status(&self, task: &TaskId) -> Result<TaskStatus, RunnerError> {
            let started = self.started.lock().unwrap()[task];
            let state = if started.elapsed() >= self.delay {
                TaskState::Completed
            } else {
                TaskState::Running
            };
            Ok(TaskStatus::new(state, 0.5))
        }

        async fn fetch_result(&self, _task: &TaskId) -> Result<RunOutput, RunnerError> {
            Ok(RunOutput {
                objectives: [("score".to_string(), 1.0)].into_iter().collect(),
            })
        }

        async fn cancel(&self, task: &TaskId) -> Result<(), RunnerError> {
            self.cancelled.lock().unwrap().push(task.clone());
            Ok(())
        }
    }

    fn exec(concurrency: usize) -> ExecutionConfig {
        ExecutionConfig {
            concurrency,
            poll_interval_ms: 10,
            ..ExecutionConfig::default()
        }
    }

    fn config(n: i64) -> Configuration {
        Configuration::from_pairs([("n", ParamValue::Int(n))]).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_and_await() {
        let runner = Arc::new(Scripted::new(Duration::from_millis(50), 0));
        let coord = ExecutionCoordinator::new(runner, &exec(2), CancellationToken::new());
        let handle = coord.submit(1, &config(1)).await.unwrap();
        assert_eq!(coord.outstanding(), 1);
        let result = coord.await_result(handle, Duration::from_secs(5)).await;
        assert_eq!(result.status, ExperimentStatus::Succeeded);
        assert_eq!(coord.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_marks_timed_out_and_cancels_task() {
        let runner = Arc::new(Scripted::new(Duration::from_secs(60), 0));
        let coord = ExecutionCoordinator::new(runner.clone(), &exec(2), CancellationToken::new());
        let handle = coord.submit(1, &config(1)).await.unwrap();
        let result = coord.await_result(handle, Duration::from_secs(1)).await;
        assert_eq!(result.status, ExperimentStatus::TimedOut);
        assert_eq!(runner.cancelled.lock().unwrap().len(), 1);
        assert_eq!(coord.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubmit_after_success_is_short_circuited() {
        let runner = Arc::new(Scripted::new(Duration::from_millis(10), 0));
        let coord = ExecutionCoordinator::new(runner.clone(), &exec(2), CancellationToken::new());
        let first = coord.submit(1, &config(1)).await.unwrap();
        let first = coord.await_result(first, Duration::from_secs(5)).await;

        let again = coord.submit(1, &config(1)).await.unwrap();
        assert!(again.is_cached());
        let second = coord.await_result(again, Duration::from_secs(5)).await;
        assert_eq!(second.id, first.id);
        assert_eq!(runner.submits.load(Ordering::SeqCst), 1);

        // A new cycle runs it again.
        let next = coord.submit(2, &config(1)).await.unwrap();
        assert!(!next.is_cached());
    }

    #[test]
    fn test_forget_before_prunes_earlier_cycles() {
        let runner = Arc::new(Scripted::new(Duration::from_millis(10), 0));
        let coord = ExecutionCoordinator::new(runner, &exec(2), CancellationToken::new());
        let scored = |cycle: u32, n: i64| {
            ExperimentResult::succeeded(
                cycle,
                config(n),
                [("score".to_string(), 1.0)].into_iter().collect(),
                Utc::now(),
            )
        };
        coord.remember(&scored(1, 1));
        coord.remember(&scored(1, 2));
        coord.remember(&scored(2, 1));
        assert_eq!(coord.cached_len(), 3);

        coord.forget_before(2);
        assert_eq!(coord.cached_len(), 1);
        assert!(coord.cached(1, config(1).id()).is_none());
        assert!(coord.cached(2, config(1).id()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_respects_ceiling() {
        let runner = Arc::new(Scripted::new(Duration::from_millis(100), 0));
        let coord = Arc::new(ExecutionCoordinator::new(runner, &exec(3), CancellationToken::new()));
        let configs: Vec<_> = (0..10).map(config).collect();
        let mut rx = coord.run_batch(1, configs, RetryPolicy::none(), Duration::from_secs(5));

        let mut finished = 0;
        while let Some(update) = rx.recv().await {
            if let BatchUpdate::Finished { result } = update {
                assert!(result.is_succeeded());
                finished += 1;
            }
        }
        assert_eq!(finished, 10);
        assert_eq!(coord.peak_outstanding(), 3);
        assert_eq!(coord.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_retries_transient_submit_failures() {
        let runner = Arc::new(Scripted::new(Duration::from_millis(10), 2));
        let coord = Arc::new(ExecutionCoordinator::new(runner, &exec(1), CancellationToken::new()));
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 100,
            ..RetryPolicy::default()
        };
        let mut rx = coord.run_batch(1, vec![config(1)], policy, Duration::from_secs(5));

        let mut retries = 0;
        let mut result = None;
        while let Some(update) = rx.recv().await {
            match update {
                BatchUpdate::Retrying { .. } => retries += 1,
                BatchUpdate::Finished { result: r } => result = Some(r),
                BatchUpdate::Submitted { .. } => {}
            }
        }
        let result = result.unwrap();
        assert_eq!(retries, 2);
        assert!(result.is_succeeded());
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_resolves_outstanding_as_cancelled() {
        let runner = Arc::new(Scripted::new(Duration::from_secs(3600), 0));
        let token = CancellationToken::new();
        let coord = Arc::new(ExecutionCoordinator::new(runner, &exec(2), token.clone()));
        let configs: Vec<_> = (0..4).map(config).collect();
        let mut rx = coord.run_batch(1, configs, RetryPolicy::default(), Duration::from_secs(7200));

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        let mut statuses = Vec::new();
        while let Some(update) = rx.recv().await {
            if let BatchUpdate::Finished { result } = update {
                statuses.push(result.status);
            }
        }
        assert_eq!(statuses.len(), 4);
        assert!(statuses.iter().all(|s| *s == ExperimentStatus::Cancelled));
        assert_eq!(coord.outstanding(), 0);
    }
}

// tests/coordinator_test.rs — Integration test: execution coordinator over the simulator

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use sciloop::agents::DesignSpace;
use sciloop::core::coordinator::{BatchUpdate, ExecutionCoordinator};
use sciloop::core::retry::RetryPolicy;
use sciloop::core::types::{Configuration, ExperimentResult, ExperimentStatus};
use sciloop::infra::config::{ExecutionConfig, SimulatorConfig};
use sciloop::runner::simulator::SimulatedRunner;

fn simulator(min_ms: u64, max_ms: u64, failure_rate: f64) -> Arc<SimulatedRunner> {
    Arc::new(SimulatedRunner::new(SimulatorConfig {
        min_latency_ms: min_ms,
        max_latency_ms: max_ms,
        failure_rate,
        seed: 11,
    }))
}

fn coordinator(runner: Arc<SimulatedRunner>, concurrency: usize) -> Arc<ExecutionCoordinator> {
    let config = ExecutionConfig {
        concurrency,
        poll_interval_ms: 5,
        retry: RetryPolicy::none(),
        ..ExecutionConfig::default()
    };
    Arc::new(ExecutionCoordinator::new(
        runner,
        &config,
        CancellationToken::new(),
    ))
}

fn configs(n: usize) -> Vec<Configuration> {
    DesignSpace::sci_default()
        .grid()
        .unwrap()
        .into_iter()
        .take(n)
        .collect()
}

async fn drain(mut rx: tokio::sync::mpsc::Receiver<BatchUpdate>) -> (usize, Vec<ExperimentResult>) {
    let mut submitted = 0;
    let mut finished = Vec::new();
    while let Some(update) = rx.recv().await {
        match update {
            BatchUpdate::Submitted { .. } => submitted += 1,
            BatchUpdate::Retrying { .. } => {}
            BatchUpdate::Finished { result } => finished.push(result),
        }
    }
    (submitted, finished)
}

#[tokio::test(start_paused = true)]
async fn test_batch_respects_concurrency_ceiling() {
    let coord = coordinator(simulator(20, 60, 0.0), 3);
    let batch = configs(10);
    let expected: HashSet<_> = batch.iter().map(|c| c.id().clone()).collect();

    let rx = coord.run_batch(1, batch, RetryPolicy::none(), Duration::from_secs(5));
    let (submitted, finished) = drain(rx).await;

    assert_eq!(submitted, 10);
    assert_eq!(finished.len(), 10);
    assert!(finished.iter().all(|r| r.status == ExperimentStatus::Succeeded));
    let got: HashSet<_> = finished.iter().map(|r| r.config_id().clone()).collect();
    assert_eq!(got, expected);

    assert_eq!(coord.peak_outstanding(), 3);
    assert_eq!(coord.outstanding(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_resubmitting_succeeded_config_reuses_result() {
    let coord = coordinator(simulator(10, 10, 0.0), 2);
    let config = configs(1).remove(0);

    let handle = coord.submit(4, &config).await.unwrap();
    assert!(!handle.is_cached());
    let first = coord.await_result(handle, Duration::from_secs(1)).await;
    assert!(first.is_succeeded());

    let again = coord.submit(4, &config).await.unwrap();
    assert!(again.is_cached());
    assert!(again.task_id().is_none());
    let second = coord.await_result(again, Duration::from_secs(1)).await;
    assert_eq!(second, first);

    // A later cycle runs it for real.
    let next_cycle = coord.submit(5, &config).await.unwrap();
    assert!(!next_cycle.is_cached());
    coord.await_result(next_cycle, Duration::from_secs(1)).await;
    assert_eq!(coord.outstanding(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_slow_tasks_time_out_and_free_slots() {
    let coord = coordinator(simulator(5_000, 5_000, 0.0), 2);
    let rx = coord.run_batch(1, configs(4), RetryPolicy::none(), Duration::from_millis(100));
    let (_, finished) = drain(rx).await;

    assert_eq!(finished.len(), 4);
    assert!(finished.iter().all(|r| r.status == ExperimentStatus::TimedOut));
    assert_eq!(coord.outstanding(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failures_are_results_not_errors() {
    let coord = coordinator(simulator(10, 20, 1.0), 4);
    let rx = coord.run_batch(2, configs(3), RetryPolicy::none(), Duration::from_secs(1));
    let (_, finished) = drain(rx).await;

    assert_eq!(finished.len(), 3);
    for r in &finished {
        assert_eq!(r.status, ExperimentStatus::Failed);
        assert!(r.objectives.is_empty());
        assert!(r.error.is_some());
        assert_eq!(r.cycle, 2);
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancel_resolves_every_task() {
    let coord = coordinator(simulator(10_000, 10_000, 0.0), 2);
    let rx = coord.run_batch(1, configs(5), RetryPolicy::none(), Duration::from_secs(60));

    let canceller = coord.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let (_, finished) = drain(rx).await;
    assert_eq!(finished.len(), 5);
    assert!(finished.iter().all(|r| r.status == ExperimentStatus::Cancelled));
    assert_eq!(coord.outstanding(), 0);
    assert!(coord.is_cancelled());
}

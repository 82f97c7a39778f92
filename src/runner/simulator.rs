// src/runner/simulator.rs — In-process simulated runner
//
// Produces deterministic synthetic objectives for compressive-imaging style
// configurations without training anything. Run time, noise and failures
// are derived from a hash of the configuration id and the seed, so a given
// configuration always behaves the same way.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use super::{RunOutput, Runner, TaskState, TaskStatus};
use crate::core::types::{Configuration, TaskId};
use crate::infra::config::SimulatorConfig;
use crate::infra::errors::RunnerError;

struct SimTask {
    config: Configuration,
    started: Instant,
    duration: Duration,
    fails: bool,
    cancelled: bool,
}

pub struct SimulatedRunner {
    config: SimulatorConfig,
    tasks: Mutex<HashMap<TaskId, SimTask>>,
    next_id: AtomicU64,
}

impl SimulatedRunner {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            config,
            tasks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Uniform value in [0, 1) derived from the config id, the seed and a salt.
    fn unit(&self, config: &Configuration, salt: &str) -> f64 {
        let mut hasher = Sha256::new();
        hasher.update(config.id().as_str().as_bytes());
        hasher.update(self.config.seed.to_le_bytes());
        hasher.update(salt.as_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        (u64::from_le_bytes(bytes) >> 11) as f64 / (1u64 << 53) as f64
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<TaskId, SimTask>>, RunnerError> {
        self.tasks.lock().map_err(|_| RunnerError::Internal {
            runner: self.id().to_string(),
            message: "task table poisoned".into(),
        })
    }

    fn unknown(&self, task: &TaskId) -> RunnerError {
        RunnerError::Rejected {
            runner: self.id().to_string(),
            message: format!("unknown task '{task}'"),
        }
    }

    /// Synthetic objectives. Quality grows with model capacity and falls
    /// with compression; latency and memory grow with capacity.
    pub fn objectives(&self, config: &Configuration) -> BTreeMap<String, f64> {
        let num = |name: &str, default: f64| {
            config.get(name).and_then(|v| v.as_f64()).unwrap_or(default)
        };
        let cr = num("compression_ratio", 16.0);
        let stages = num("num_stages", 7.0);
        let features = num("num_features", 64.0).max(1.0);
        let blocks = num("num_blocks", 3.0);
        let lr = num("learning_rate", 1e-4).max(1e-12);
        let mask_bonus = match config.get("mask_type").map(|v| v.to_string()) {
            Some(m) if m == "optimized" => 0.8,
            _ => 0.0,
        };
        let noise = self.unit(config, "noise") * 2.0 - 1.0;

        let psnr = 24.0 + 1.5 * (features / 32.0).log2() + 0.6 * (stages - 5.0)
            + 0.4 * (blocks - 2.0)
            - 0.18 * (cr - 8.0)
            + mask_bonus
            - 2.0 * (lr.log10() + 4.0).abs()
            + 0.5 * noise;
        let ssim = (0.5 + psnr / 60.0).clamp(0.0, 0.99);
        let latency = 1.0 + 0.004 * stages * features * blocks * (1.0 + 0.05 * noise);
        let memory = 0.5 + features * blocks * stages / 1500.0;

        [
            ("psnr".to_string(), psnr),
            ("ssim".to_string(), ssim),
            ("latency".to_string(), latency),
            ("memory".to_string(), memory),
        ]
        .into_iter()
        .collect()
    }
}

#[async_trait]
impl Runner for SimulatedRunner {
    fn id(&self) -> &str {
        "simulator"
    }

    async fn submit(&self, config: &Configuration) -> Result<TaskId, RunnerError> {
        let span = self
            .config
            .max_latency_ms
            .saturating_sub(self.config.min_latency_ms);
        let duration = Duration::from_millis(
            self.config.min_latency_ms + (self.unit(config, "latency") * span as f64) as u64,
        );
        let fails = self.unit(config, "failure") < self.config.failure_rate;
        let id = format!("sim-{}", self.next_id.fetch_add(1, Ordering::Relaxed));

        self.lock()?.insert(
            id.clone(),
            SimTask {
                config: config.clone(),
                started: Instant::now(),
                duration,
                fails,
                cancelled: false,
            },
        );
        tracing::debug!(task = %id, config_id = %config.id(), "Simulated task submitted");
        Ok(id)
    }

    async fn poll_status(&self, task: &TaskId) -> Result<TaskStatus, RunnerError> {
        let tasks = self.lock()?;
        let t = tasks.get(task).ok_or_else(|| self.unknown(task))?;
        if t.cancelled {
            return Ok(TaskStatus::new(TaskState::Failed, 0.0));
        }
        let elapsed = t.started.elapsed();
        if elapsed < t.duration {
            let progress = elapsed.as_secs_f32() / t.duration.as_secs_f32().max(f32::EPSILON);
            return Ok(TaskStatus::new(TaskState::Running, progress.min(1.0)));
        }
        let state = if t.fails {
            TaskState::Failed
        } else {
            TaskState::Completed
        };
        Ok(TaskStatus::new(state, 1.0))
    }

    async fn fetch_result(&self, task: &TaskId) -> Result<RunOutput, RunnerError> {
        let config = {
            let tasks = self.lock()?;
            let t = tasks.get(task).ok_or_else(|| self.unknown(task))?;
            if t.cancelled {
                return Err(RunnerError::Cancelled);
            }
            if t.fails {
                return Err(RunnerError::Internal {
                    runner: self.id().to_string(),
                    message: "simulated training divergence".into(),
                });
            }
            t.config.clone()
        };
        Ok(RunOutput {
            objectives: self.objectives(&config),
        })
    }

    async fn cancel(&self, task: &TaskId) -> Result<(), RunnerError> {
        if let Some(t) = self.lock()?.get_mut(task) {
            t.cancelled = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ParamValue;

    fn sim(failure_rate: f64) -> SimulatedRunner {
        SimulatedRunner::new(SimulatorConfig {
            min_latency_ms: 10,
            max_latency_ms: 20,
            failure_rate,
            seed: 7,
        })
    }

    fn config(features: i64) -> Configuration {
        Configuration::from_pairs([
            ("compression_ratio", ParamValue::Int(16)),
            ("num_features", ParamValue::Int(features)),
        ])
        .unwrap()
    }

    #[test]
    fn test_objectives_deterministic() {
        let s = sim(0.0);
        assert_eq!(s.objectives(&config(64)), s.objectives(&config(64)));
    }

    #[test]
    fn test_capacity_trades_quality_for_latency() {
        let s = sim(0.0);
        let small = s.objectives(&config(32));
        let large = s.objectives(&config(128));
        assert!(large["psnr"] > small["psnr"]);
        assert!(large["latency"] > small["latency"]);
        assert!(large["memory"] > small["memory"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_lifecycle() {
        let s = sim(0.0);
        let id = s.submit(&config(64)).await.unwrap();
        assert_eq!(s.poll_status(&id).await.unwrap().state, TaskState::Running);

        tokio::time::advance(Duration::from_millis(25)).await;
        assert_eq!(s.poll_status(&id).await.unwrap().state, TaskState::Completed);
        let out = s.fetch_result(&id).await.unwrap();
        assert!(out.objectives.contains_key("psnr"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_rate_one_always_fails() {
        let s = sim(1.0);
        let id = s.submit(&config(64)).await.unwrap();
        tokio::time::advance(Duration::from_millis(25)).await;
        assert_eq!(s.poll_status(&id).await.unwrap().state, TaskState::Failed);
        assert!(matches!(
            s.fetch_result(&id).await,
            Err(RunnerError::Internal { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancelled_task_reports_failed() {
        let s = sim(0.0);
        let id = s.submit(&config(64)).await.unwrap();
        s.cancel(&id).await.unwrap();
        assert_eq!(s.poll_status(&id).await.unwrap().state, TaskState::Failed);
        assert_eq!(s.fetch_result(&id).await, Err(RunnerError::Cancelled));
    }

    #[tokio::test]
    async fn test_unknown_task_rejected() {
        let s = sim(0.0);
        assert!(matches!(
            s.poll_status(&"nope".to_string()).await,
            Err(RunnerError::Rejected { .. })
        ));
    }
}

// src/core/bus.rs — In-process event dispatcher
//
// Each subscriber owns a queue and a worker task, so a subscriber sees
// events in publish order while a slow or failing subscriber never holds
// up the others. Every handler call runs under its own timeout and panic
// boundary. Subscribers live in an explicit registry owned by the bus;
// there is no process-wide state.

use std::collections::{BTreeMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::types::{ConfigId, ExperimentStatus, Phase, TerminalReason};
use crate::infra::config::BusConfig;

/// Discriminant used to route events to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PhaseChanged,
    PlanProposed,
    PlanRejected,
    PlanApproved,
    ExperimentSubmitted,
    ExperimentRetrying,
    ExperimentCompleted,
    FrontUpdated,
    InsightGenerated,
    RunTerminated,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineEvent {
    PhaseChanged {
        cycle: u32,
        from: Phase,
        to: Phase,
    },
    PlanProposed {
        cycle: u32,
        attempt: u32,
        config_ids: Vec<ConfigId>,
    },
    PlanRejected {
        cycle: u32,
        attempt: u32,
        feedback: String,
    },
    PlanApproved {
        cycle: u32,
        size: usize,
    },
    ExperimentSubmitted {
        cycle: u32,
        config_id: ConfigId,
    },
    ExperimentRetrying {
        cycle: u32,
        config_id: ConfigId,
        attempt: u32,
        reason: String,
    },
    ExperimentCompleted {
        cycle: u32,
        config_id: ConfigId,
        status: ExperimentStatus,
        objectives: BTreeMap<String, f64>,
    },
    FrontUpdated {
        cycle: u32,
        stratum: Option<String>,
        size: usize,
    },
    InsightGenerated {
        cycle: u32,
        summary: String,
    },
    RunTerminated {
        cycle: u32,
        reason: TerminalReason,
        budget_consumed: u32,
        budget_total: u32,
    },
}

impl EngineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::PhaseChanged { .. } => EventKind::PhaseChanged,
            Self::PlanProposed { .. } => EventKind::PlanProposed,
            Self::PlanRejected { .. } => EventKind::PlanRejected,
            Self::PlanApproved { .. } => EventKind::PlanApproved,
            Self::ExperimentSubmitted { .. } => EventKind::ExperimentSubmitted,
            Self::ExperimentRetrying { .. } => EventKind::ExperimentRetrying,
            Self::ExperimentCompleted { .. } => EventKind::ExperimentCompleted,
            Self::FrontUpdated { .. } => EventKind::FrontUpdated,
            Self::InsightGenerated { .. } => EventKind::InsightGenerated,
            Self::RunTerminated { .. } => EventKind::RunTerminated,
        }
    }
}

/// Envelope delivered to handlers.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: String,
    pub sender: String,
    pub timestamp: DateTime<Utc>,
    pub payload: EngineEvent,
}

impl Event {
    pub fn new(sender: impl Into<String>, payload: EngineEvent) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender: sender.into(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

/// Adapts a synchronous closure into an `EventHandler`.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&Event) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (self.0)(event)
    }
}

pub fn handler_fn<F>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

// -- Registry --

enum Delivery {
    Event(Arc<Event>),
    Flush(oneshot::Sender<()>),
}

struct Subscriber {
    /// `None` receives every kind.
    kind: Option<EventKind>,
    queue: mpsc::UnboundedSender<Delivery>,
}

/// Subscribers in registration order.
#[derive(Default)]
pub struct SubscriberRegistry {
    subscribers: Vec<Subscriber>,
    workers: Vec<JoinHandle<()>>,
}

impl SubscriberRegistry {
    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    fn matching(&self, kind: EventKind) -> impl Iterator<Item = &Subscriber> {
        self.subscribers
            .iter()
            .filter(move |s| s.kind.map_or(true, |k| k == kind))
    }
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    handled: AtomicU64,
    failed: AtomicU64,
}

// -- Bus --

pub struct EventBus {
    registry: Mutex<SubscriberRegistry>,
    history: Mutex<VecDeque<Arc<Event>>>,
    history_limit: usize,
    handler_timeout: Duration,
    counters: Arc<Counters>,
}

impl EventBus {
    pub fn new(config: &BusConfig) -> Self {
        Self {
            registry: Mutex::new(SubscriberRegistry::default()),
            history: Mutex::new(VecDeque::new()),
            history_limit: config.history_limit,
            handler_timeout: Duration::from_millis(config.handler_timeout_ms),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Register `handler` for one event kind. Must be called inside a
    /// tokio runtime; the subscriber's worker is spawned immediately.
    pub fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        self.add_subscriber(Some(kind), handler);
    }

    /// Register `handler` for every event kind.
    pub fn subscribe_all(&self, handler: Arc<dyn EventHandler>) {
        self.add_subscriber(None, handler);
    }

    fn add_subscriber(&self, kind: Option<EventKind>, handler: Arc<dyn EventHandler>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_subscriber(
            rx,
            handler,
            self.handler_timeout,
            self.counters.clone(),
        ));
        match self.registry.lock() {
            Ok(mut reg) => {
                reg.subscribers.push(Subscriber { kind, queue: tx });
                reg.workers.push(worker);
            }
            Err(_) => {
                tracing::error!("Subscriber registry poisoned; dropping subscription");
                worker.abort();
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Hand `payload` to every matching subscriber's queue. Never waits on
    /// handlers.
    pub fn publish(&self, sender: &str, payload: EngineEvent) -> Arc<Event> {
        let event = Arc::new(Event::new(sender, payload));
        self.publish_event(event.clone());
        event
    }

    pub fn publish_event(&self, event: Arc<Event>) {
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut history) = self.history.lock() {
            history.push_back(event.clone());
            while history.len() > self.history_limit {
                history.pop_front();
            }
        }

        let kind = event.kind();
        match self.registry.lock() {
            Ok(reg) => {
                for sub in reg.matching(kind) {
                    // A closed queue means the bus is shutting down.
                    let _ = sub.queue.send(Delivery::Event(event.clone()));
                }
            }
            Err(_) => tracing::error!(?kind, "Subscriber registry poisoned; event not delivered"),
        }
        tracing::debug!(?kind, sender = %event.sender, "Event published");
    }

    /// Wait until every event published so far has been handled.
    pub async fn flush(&self) {
        let waiters: Vec<oneshot::Receiver<()>> = match self.registry.lock() {
            Ok(reg) => reg
                .subscribers
                .iter()
                .filter_map(|s| {
                    let (tx, rx) = oneshot::channel();
                    s.queue.send(Delivery::Flush(tx)).ok().map(|_| rx)
                })
                .collect(),
            Err(_) => Vec::new(),
        };
        for rx in waiters {
            let _ = rx.await;
        }
    }

    /// Drain every queue and stop the workers.
    pub async fn shutdown(&self) {
        let workers = match self.registry.lock() {
            Ok(mut reg) => {
                reg.subscribers.clear();
                std::mem::take(&mut reg.workers)
            }
            Err(_) => Vec::new(),
        };
        for worker in workers {
            let _ = worker.await;
        }
    }

    /// Most recent events, oldest first.
    pub fn history(&self) -> Vec<Arc<Event>> {
        self.history
            .lock()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn history_of(&self, kind: EventKind) -> Vec<Arc<Event>> {
        self.history()
            .into_iter()
            .filter(|e| e.kind() == kind)
            .collect()
    }

    pub fn published(&self) -> u64 {
        self.counters.published.load(Ordering::Relaxed)
    }

    /// Handler invocations that errored, panicked or timed out.
    pub fn handler_failures(&self) -> u64 {
        self.counters.failed.load(Ordering::Relaxed)
    }

    pub fn handled(&self) -> u64 {
        self.counters.handled.load(Ordering::Relaxed)
    }
}

async fn run_subscriber(
    mut rx: mpsc::UnboundedReceiver<Delivery>,
    handler: Arc<dyn EventHandler>,
    timeout: Duration,
    counters: Arc<Counters>,
) {
    while let Some(delivery) = rx.recv().await {
        let event = match delivery {
            Delivery::Event(event) => event,
            Delivery::Flush(done) => {
                let _ = done.send(());
                continue;
            }
        };

        let call = AssertUnwindSafe(handler.handle(&event)).catch_unwind();
        let failure = match tokio::time::timeout(timeout, call).await {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(e))) => Some(e.to_string()),
            Ok(Err(_)) => Some("handler panicked".to_string()),
            Err(_) => Some(format!("handler timed out after {}ms", timeout.as_millis())),
        };

        match failure {
            None => {
                counters.handled.fetch_add(1, Ordering::Relaxed);
            }
            Some(reason) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(kind = ?event.kind(), event_id = %event.id, "Event handler failed: {reason}");
            }
        }
    }
}

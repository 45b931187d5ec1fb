//! Observability gauges.
//!
//! Counters are plain atomics; the per-task-type gauges are refreshed from
//! the broker's own statistics by [`StatsSampler`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::queue::task::probe_kind_of;
use crate::queue::{BrokerStats, MemoryBroker};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskTypeGauge {
    pub pending: usize,
    pub active: usize,
    pub processed: u64,
    pub failed: u64,
    pub last_duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub heartbeat_workers: usize,
    pub sessions_completed: u64,
    pub sessions_discarded: u64,
    pub transitions_emitted: u64,
    /// Probe task gauges keyed by family
    pub probe_tasks: BTreeMap<String, TaskTypeGauge>,
    /// Oldest pending task per queue, in milliseconds
    pub queue_latency_ms: BTreeMap<String, u64>,
}

#[derive(Default)]
pub struct Metrics {
    heartbeat_workers: AtomicUsize,
    sessions_completed: AtomicU64,
    sessions_discarded: AtomicU64,
    transitions_emitted: AtomicU64,
    probe_tasks: Mutex<BTreeMap<String, TaskTypeGauge>>,
    queue_latency_ms: Mutex<BTreeMap<String, u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide instance used by the worker binary
    pub fn global() -> Arc<Self> {
        static INSTANCE: OnceLock<Arc<Metrics>> = OnceLock::new();
        INSTANCE.get_or_init(|| Arc::new(Metrics::new())).clone()
    }

    pub fn set_heartbeat_workers(&self, count: usize) {
        self.heartbeat_workers.store(count, Ordering::Relaxed);
    }

    pub fn heartbeat_workers(&self) -> usize {
        self.heartbeat_workers.load(Ordering::Relaxed)
    }

    pub fn inc_sessions_completed(&self) {
        self.sessions_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sessions_discarded(&self) {
        self.sessions_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_transitions_emitted(&self) {
        self.transitions_emitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Replace the queue gauges with a fresh broker sample
    pub fn record_broker_stats(&self, stats: &BrokerStats) {
        let probe_tasks: BTreeMap<String, TaskTypeGauge> = stats
            .task_types
            .iter()
            .filter_map(|t| {
                let kind = probe_kind_of(&t.task_type)?;
                let gauge = TaskTypeGauge {
                    pending: t.pending,
                    active: t.active,
                    processed: t.processed,
                    failed: t.failed,
                    last_duration_ms: t.last_duration.map(|d| d.as_millis() as u64),
                };
                Some((kind.to_string(), gauge))
            })
            .collect();
        let latency = stats
            .queues
            .iter()
            .map(|q| (q.name.clone(), q.latency.as_millis() as u64))
            .collect();

        *lock(&self.probe_tasks) = probe_tasks;
        *lock(&self.queue_latency_ms) = latency;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            heartbeat_workers: self.heartbeat_workers(),
            sessions_completed: self.sessions_completed.load(Ordering::Relaxed),
            sessions_discarded: self.sessions_discarded.load(Ordering::Relaxed),
            transitions_emitted: self.transitions_emitted.load(Ordering::Relaxed),
            probe_tasks: lock(&self.probe_tasks).clone(),
            queue_latency_ms: lock(&self.queue_latency_ms).clone(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Samples broker statistics into [`Metrics`] on a fixed interval
pub struct StatsSampler {
    broker: Arc<MemoryBroker>,
    metrics: Arc<Metrics>,
    interval: Duration,
}

impl StatsSampler {
    pub fn new(broker: Arc<MemoryBroker>, metrics: Arc<Metrics>, interval: Duration) -> Self {
        Self { broker, metrics, interval }
    }

    pub fn sample(&self) {
        self.metrics.record_broker_stats(&self.broker.stats());
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        info!("Queue stats sampler started (every {:?})", self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sample();
                    match serde_json::to_string(&self.metrics.snapshot()) {
                        Ok(snapshot) => debug!(target: "uppe::metrics", "{snapshot}"),
                        Err(e) => debug!("Failed to serialize metrics snapshot: {e}"),
                    }
                }
            }
        }
    }
}

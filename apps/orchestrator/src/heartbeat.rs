//! Heartbeat reconciliation.
//!
//! Keeps exactly one worker per active heartbeat pipeline. Each worker
//! re-triggers its pipeline on a fixed cadence and waits, bounded, for the
//! previous invocation to finish before the next one.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use probe_agent::ProbeKind;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatch::InvocationDispatcher;
use crate::error::{QueueError, StoreError};
use crate::metrics::Metrics;
use crate::models::{InvocationPayload, PipelineId, Trigger};
use crate::queue::{Inspector, TaskState};
use crate::store::PipelineStore;

#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    /// How often the worker set is reconciled with the pipeline store
    pub reconcile_interval: Duration,
    /// Cadence of each worker's invocations
    pub trigger_interval: Duration,
    /// How long a worker waits for its invocation before deleting it
    pub completion_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(10),
            trigger_interval: Duration::from_secs(15),
            completion_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Workers started and stopped by one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: Vec<PipelineId>,
    pub stopped: Vec<PipelineId>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty()
    }
}

/// How a worker's wait for its invocation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Finished(TaskState),
    /// The task was no longer known to the queue
    Gone,
    /// Deadline passed; the task was deleted (or could not be)
    TimedOut,
    Cancelled,
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct HeartbeatReconciler {
    pipelines: Arc<dyn PipelineStore>,
    dispatcher: Arc<InvocationDispatcher>,
    inspector: Arc<dyn Inspector>,
    metrics: Arc<Metrics>,
    config: HeartbeatConfig,
    workers: Mutex<HashMap<PipelineId, Worker>>,
}

impl HeartbeatReconciler {
    pub fn new(
        pipelines: Arc<dyn PipelineStore>,
        dispatcher: Arc<InvocationDispatcher>,
        inspector: Arc<dyn Inspector>,
        metrics: Arc<Metrics>,
        config: HeartbeatConfig,
    ) -> Self {
        Self { pipelines, dispatcher, inspector, metrics, config, workers: Mutex::new(HashMap::new()) }
    }

    fn workers(&self) -> MutexGuard<'_, HashMap<PipelineId, Worker>> {
        self.workers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn worker_count(&self) -> usize {
        self.workers().len()
    }

    pub fn running(&self) -> BTreeSet<PipelineId> {
        self.workers().keys().copied().collect()
    }

    /// Bring the worker set in line with the active heartbeat pipelines.
    ///
    /// Workers are children of `parent`, so cancelling it stops all of them.
    pub async fn reconcile_once(&self, parent: &CancellationToken) -> Result<ReconcileReport, StoreError> {
        let active: HashMap<PipelineId, ProbeKind> = self
            .pipelines
            .get_active_heartbeat_pipelines()
            .await?
            .into_iter()
            .map(|pipeline| (pipeline.id(), pipeline.kind))
            .collect();

        let mut report = ReconcileReport::default();
        let count = {
            let mut workers = self.workers();

            let stale: Vec<PipelineId> = workers
                .iter()
                .filter(|(id, worker)| !active.contains_key(id) || worker.handle.is_finished())
                .map(|(id, _)| *id)
                .collect();
            for id in stale {
                if let Some(worker) = workers.remove(&id) {
                    worker.cancel.cancel();
                    if active.contains_key(&id) {
                        warn!(pipeline_id = id, "Heartbeat worker exited unexpectedly, restarting");
                    } else {
                        report.stopped.push(id);
                    }
                }
            }

            for (&id, &kind) in &active {
                if workers.contains_key(&id) {
                    continue;
                }
                let cancel = parent.child_token();
                let handle = tokio::spawn(run_worker(
                    id,
                    kind,
                    self.dispatcher.clone(),
                    self.inspector.clone(),
                    self.config,
                    cancel.clone(),
                ));
                workers.insert(id, Worker { cancel, handle });
                report.started.push(id);
            }
            workers.len()
        };

        report.started.sort_unstable();
        report.stopped.sort_unstable();
        self.metrics.set_heartbeat_workers(count);
        if !report.is_noop() {
            info!(
                started = ?report.started,
                stopped = ?report.stopped,
                "Heartbeat workers reconciled ({count} running)"
            );
        }
        Ok(report)
    }

    /// Reconcile on every interval until cancelled, then stop every worker
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.reconcile_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Heartbeat reconciler started (every {:?})", self.config.reconcile_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile_once(&cancel).await {
                        warn!("Heartbeat reconciliation failed: {e}");
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// Cancel every worker and wait for them to exit
    pub async fn shutdown(&self) {
        let workers: Vec<(PipelineId, Worker)> = self.workers().drain().collect();
        for (_, worker) in &workers {
            worker.cancel.cancel();
        }
        for (id, worker) in workers {
            if let Err(e) = worker.handle.await {
                warn!(pipeline_id = id, "Heartbeat worker ended abnormally: {e}");
            }
        }
        self.metrics.set_heartbeat_workers(0);
        info!("Heartbeat reconciler stopped");
    }
}

async fn run_worker(
    pipeline_id: PipelineId,
    kind: ProbeKind,
    dispatcher: Arc<InvocationDispatcher>,
    inspector: Arc<dyn Inspector>,
    config: HeartbeatConfig,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(config.trigger_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(pipeline_id, "Heartbeat worker started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let payload = InvocationPayload::new(pipeline_id, kind, Trigger::Heartbeat);
        let info = match dispatcher.dispatch(payload).await {
            Ok(info) => info,
            Err(e) => {
                warn!(pipeline_id, "Heartbeat dispatch failed: {e}");
                continue;
            }
        };

        let completion = await_completion(inspector.as_ref(), &info.queue, &info.id, config, &cancel).await;
        debug!(pipeline_id, task_id = %info.id, "Heartbeat invocation ended: {completion:?}");
    }

    debug!(pipeline_id, "Heartbeat worker stopped");
}

/// Poll until the task finishes; past the deadline delete it
pub async fn await_completion(
    inspector: &dyn Inspector,
    queue: &str,
    task_id: &str,
    config: HeartbeatConfig,
    cancel: &CancellationToken,
) -> Completion {
    let deadline = Instant::now() + config.completion_timeout;

    loop {
        match inspector.get_task_info(queue, task_id).await {
            Ok(info) if info.state.is_finished() => return Completion::Finished(info.state),
            Ok(_) => {}
            Err(QueueError::TaskNotFound { .. }) => return Completion::Gone,
            Err(e) => debug!(task_id, "Task inspection failed: {e}"),
        }

        let now = Instant::now();
        if now >= deadline {
            match inspector.delete_task(queue, task_id).await {
                Ok(()) => info!(task_id, "Deleted stale heartbeat task"),
                Err(QueueError::TaskActive { .. }) => {
                    warn!(task_id, "Stale heartbeat task is still running, leaving it")
                }
                Err(QueueError::TaskNotFound { .. }) => {}
                Err(e) => warn!(task_id, "Failed to delete stale heartbeat task: {e}"),
            }
            return Completion::TimedOut;
        }

        let wait = config.poll_interval.min(deadline - now);
        tokio::select! {
            _ = cancel.cancelled() => return Completion::Cancelled,
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

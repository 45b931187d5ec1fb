//! Queue task handlers.
//!
//! One [`ProbeTaskHandler`] per probe family, all sharing the same
//! coordinator; the stats and notification handlers persist and deliver.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::diff::DiffOutcome;
use crate::error::{StoreError, TaskError};
use crate::fanout::{FanOutCoordinator, InvocationResult};
use crate::metrics::Metrics;
use crate::models::{InvocationPayload, ProbeOutcome, TransitionEvent};
use crate::notify::NotificationSink;
use crate::probe::ProbeFamily;
use crate::queue::task::TYPE_STATS_BULK_WRITE;
use crate::queue::{GroupAggregator, Task, TaskContext, TaskHandler};
use crate::store::{PipelineStore, StatsStore};

pub struct ProbeTaskHandler {
    family: Arc<dyn ProbeFamily>,
    pipelines: Arc<dyn PipelineStore>,
    coordinator: Arc<FanOutCoordinator>,
    metrics: Arc<Metrics>,
}

impl ProbeTaskHandler {
    pub fn new(
        family: Arc<dyn ProbeFamily>,
        pipelines: Arc<dyn PipelineStore>,
        coordinator: Arc<FanOutCoordinator>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { family, pipelines, coordinator, metrics }
    }
}

#[async_trait]
impl TaskHandler for ProbeTaskHandler {
    async fn process(&self, ctx: &TaskContext, task: &Task) -> Result<(), TaskError> {
        let payload: InvocationPayload = task.decode()?;
        if payload.kind != self.family.kind() {
            return Err(TaskError::skip_retry(format!(
                "{} payload routed to the {} handler",
                payload.kind,
                self.family.kind()
            )));
        }

        let pipeline = match self.pipelines.get_pipeline(payload.pipeline_id).await {
            Ok(pipeline) => pipeline,
            Err(StoreError::PipelineNotFound(id)) => {
                return Err(TaskError::skip_retry(format!("pipeline {id} no longer exists")));
            }
            Err(e) => return Err(e.into()),
        };
        if pipeline.kind != self.family.kind() {
            return Err(TaskError::skip_retry(format!(
                "pipeline {} is a {} pipeline",
                pipeline.id(),
                pipeline.kind
            )));
        }
        if !pipeline.scheduling.is_runnable(Utc::now()) {
            debug!(pipeline_id = pipeline.id(), task_id = %ctx.task_id, "Skipping inactive or expired pipeline");
            return Ok(());
        }

        match self.coordinator.invoke(&pipeline, self.family.clone(), &payload.context()).await? {
            InvocationResult::Completed { diff, .. } => {
                self.metrics.inc_sessions_completed();
                if matches!(diff, Some(DiffOutcome::Emitted(_))) {
                    self.metrics.inc_transitions_emitted();
                }
                Ok(())
            }
            InvocationResult::Discarded { error, .. } => {
                self.metrics.inc_sessions_discarded();
                Err(TaskError::skip_retry(format!("session discarded: {error}")))
            }
            InvocationResult::NoTargets => Ok(()),
        }
    }
}

pub struct StatsWriteHandler {
    store: Arc<dyn StatsStore>,
}

impl StatsWriteHandler {
    pub fn new(store: Arc<dyn StatsStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TaskHandler for StatsWriteHandler {
    async fn process(&self, _ctx: &TaskContext, task: &Task) -> Result<(), TaskError> {
        let outcome: ProbeOutcome = task.decode()?;
        self.store.write_outcome(&outcome).await?;
        Ok(())
    }
}

pub struct StatsBulkWriteHandler {
    store: Arc<dyn StatsStore>,
}

impl StatsBulkWriteHandler {
    pub fn new(store: Arc<dyn StatsStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TaskHandler for StatsBulkWriteHandler {
    async fn process(&self, ctx: &TaskContext, task: &Task) -> Result<(), TaskError> {
        let outcomes: Vec<ProbeOutcome> = task.decode()?;
        if outcomes.is_empty() {
            return Ok(());
        }
        self.store.write_outcomes_bulk(&outcomes).await?;
        debug!(task_id = %ctx.task_id, count = outcomes.len(), "Bulk-inserted outcomes");
        Ok(())
    }
}

/// Joins buffered `stats:write` payloads into one `stats:bulk_write` array
pub struct StatsAggregator;

impl GroupAggregator for StatsAggregator {
    fn aggregate(&self, group: &str, tasks: Vec<Task>) -> Task {
        let mut payload = Vec::with_capacity(tasks.iter().map(|t| t.payload().len() + 1).sum::<usize>() + 2);
        payload.push(b'[');
        let mut included = 0usize;
        for task in &tasks {
            if let Err(e) = serde_json::from_slice::<ProbeOutcome>(task.payload()) {
                warn!(group, "Dropping malformed stats payload from aggregate: {e}");
                continue;
            }
            if included > 0 {
                payload.push(b',');
            }
            payload.extend_from_slice(task.payload());
            included += 1;
        }
        payload.push(b']');

        debug!(group, included, buffered = tasks.len(), "Aggregated stats writes");
        Task::new(TYPE_STATS_BULK_WRITE, payload)
    }
}

/// Fans a transition event out to every sink.
///
/// Sinks that succeeded are remembered per task id, so a retry only goes to
/// the sinks that failed.
pub struct NotificationHandler {
    sinks: Vec<Arc<dyn NotificationSink>>,
    delivered: Mutex<HashMap<String, HashSet<String>>>,
}

impl NotificationHandler {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        Self { sinks, delivered: Mutex::new(HashMap::new()) }
    }

    fn delivered(&self) -> MutexGuard<'_, HashMap<String, HashSet<String>>> {
        self.delivered.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl TaskHandler for NotificationHandler {
    async fn process(&self, ctx: &TaskContext, task: &Task) -> Result<(), TaskError> {
        let event: TransitionEvent = task.decode()?;

        let pending: Vec<&Arc<dyn NotificationSink>> = {
            let delivered = self.delivered();
            let done = delivered.get(&ctx.task_id);
            self.sinks.iter().filter(|sink| !done.is_some_and(|d| d.contains(sink.name()))).collect()
        };

        let results = join_all(pending.iter().map(|sink| sink.deliver(&event))).await;
        let mut failed = Vec::new();
        let mut succeeded = Vec::new();
        for (sink, result) in pending.iter().zip(results) {
            match result {
                Ok(()) => succeeded.push(sink.name().to_string()),
                Err(e) => {
                    warn!(task_id = %ctx.task_id, sink = sink.name(), "Notification delivery failed: {e:#}");
                    failed.push(sink.name().to_string());
                }
            }
        }

        let mut delivered = self.delivered();
        if failed.is_empty() {
            delivered.remove(&ctx.task_id);
            info!(pipeline_id = event.pipeline_id, state = %event.state, "Notification delivered");
            return Ok(());
        }

        // Last attempt: the broker archives the task, nothing will come back for it
        if ctx.retried >= ctx.max_retry {
            delivered.remove(&ctx.task_id);
        } else {
            delivered.entry(ctx.task_id.clone()).or_default().extend(succeeded);
        }
        Err(TaskError::retry(anyhow::anyhow!("delivery failed for {}", failed.join(", "))))
    }
}

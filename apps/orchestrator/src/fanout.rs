//! Fan-out coordinator.
//!
//! One invocation of a pipeline: resolve the datacenters once, run one leg
//! per datacenter concurrently, join them into a session and compare that
//! session with the previous one.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::diff::{DiffEngine, DiffOutcome};
use crate::error::{StoreError, TemplateError};
use crate::models::{DatacenterId, InvocationContext, PipelineConfig, ProbeOutcome, Session};
use crate::probe::{LegResult, PipelineExecutor, ProbeFamily};
use crate::queue::task::{QUEUE_DEFAULT, STATS_GROUP, TYPE_STATS_WRITE};
use crate::queue::{EnqueueOptions, Task, TaskQueue};
use crate::registry::{DatacenterRegistry, resolve_targets};
use crate::session::SessionCache;

/// Where each leg's outcome is persisted
#[async_trait]
pub trait OutcomeSink: Send + Sync {
    async fn persist(&self, outcome: &ProbeOutcome) -> anyhow::Result<()>;
}

/// Enqueues a `stats:write` task into the stats aggregation group
pub struct QueueOutcomeSink {
    queue: Arc<dyn TaskQueue>,
    options: EnqueueOptions,
}

impl QueueOutcomeSink {
    pub fn new(queue: Arc<dyn TaskQueue>) -> Self {
        Self { queue, options: EnqueueOptions::default().queue(QUEUE_DEFAULT).group(STATS_GROUP) }
    }
}

#[async_trait]
impl OutcomeSink for QueueOutcomeSink {
    async fn persist(&self, outcome: &ProbeOutcome) -> anyhow::Result<()> {
        let task = Task::json(TYPE_STATS_WRITE, outcome)?;
        self.queue.enqueue(task, self.options.clone()).await?;
        Ok(())
    }
}

#[derive(Debug)]
pub enum InvocationResult {
    Completed {
        session: Session,
        /// `None` when the comparison itself failed
        diff: Option<DiffOutcome>,
    },
    /// A leg hit an unresolvable template; nothing was cached or compared
    Discarded { session_id: Uuid, error: TemplateError },
    /// The selection resolved to no datacenter
    NoTargets,
}

pub struct FanOutCoordinator {
    registry: Arc<dyn DatacenterRegistry>,
    executor: Arc<PipelineExecutor>,
    sink: Arc<dyn OutcomeSink>,
    cache: Arc<dyn SessionCache>,
    diff: Arc<DiffEngine>,
}

impl FanOutCoordinator {
    pub fn new(
        registry: Arc<dyn DatacenterRegistry>,
        executor: Arc<PipelineExecutor>,
        sink: Arc<dyn OutcomeSink>,
        cache: Arc<dyn SessionCache>,
        diff: Arc<DiffEngine>,
    ) -> Self {
        Self { registry, executor, sink, cache, diff }
    }

    pub async fn invoke(
        &self,
        pipeline: &PipelineConfig,
        family: Arc<dyn ProbeFamily>,
        ctx: &InvocationContext,
    ) -> Result<InvocationResult, StoreError> {
        let targets = resolve_targets(self.registry.as_ref(), &pipeline.scheduling.selection()).await?;
        if targets.is_empty() {
            warn!(pipeline_id = pipeline.id(), "No datacenter to probe");
            return Ok(InvocationResult::NoTargets);
        }

        let pipeline = Arc::new(pipeline.with_datacenters(targets.iter().map(|t| t.id).collect()));
        let session_id = Uuid::new_v4();
        let valid = Arc::new(AtomicBool::new(true));
        info!(
            pipeline_id = pipeline.id(),
            session_id = %session_id,
            trigger = ?ctx.trigger,
            principal = %ctx.principal_label(),
            "Fanning out to {} datacenter(s)",
            targets.len()
        );

        let datacenter_ids = pipeline.scheduling.datacenter_ids.clone();
        let mut legs = JoinSet::new();
        for target in targets {
            let executor = self.executor.clone();
            let sink = self.sink.clone();
            let family = family.clone();
            let pipeline = pipeline.clone();
            let valid = valid.clone();

            legs.spawn(async move {
                let result = executor.execute_leg(family.as_ref(), session_id, &pipeline, &target).await;
                if result.is_invalidated() {
                    valid.store(false, Ordering::SeqCst);
                    return result;
                }
                if let Err(e) = sink.persist(result.outcome()).await {
                    error!(
                        pipeline_id = pipeline.id(),
                        session_id = %session_id,
                        datacenter_id = target.id,
                        "Failed to persist outcome: {e:#}"
                    );
                }
                result
            });
        }

        let mut outcomes = Vec::with_capacity(datacenter_ids.len());
        let mut template_error = None;
        while let Some(joined) = legs.join_next().await {
            match joined {
                Ok(LegResult::Completed(outcome)) => outcomes.push(outcome),
                Ok(LegResult::Invalidated { outcome, error }) => {
                    outcomes.push(outcome);
                    template_error.get_or_insert(error);
                }
                Err(e) => error!(pipeline_id = pipeline.id(), session_id = %session_id, "Leg crashed: {e}"),
            }
        }

        // A crashed leg still counts, as a failure of its datacenter.
        let reported: HashSet<DatacenterId> = outcomes.iter().map(|o| o.datacenter_id).collect();
        for datacenter_id in datacenter_ids.iter().filter(|id| !reported.contains(*id)) {
            outcomes.push(ProbeOutcome::aborted(session_id, &pipeline, *datacenter_id));
        }
        outcomes.sort_by_key(|outcome| outcome.datacenter_id);

        if !valid.load(Ordering::SeqCst) {
            warn!(pipeline_id = pipeline.id(), session_id = %session_id, "Session discarded after template failure");
            let error = template_error.unwrap_or_else(|| TemplateError::Malformed {
                placeholder: String::new(),
                reason: "leg reported an invalid session".to_string(),
            });
            return Ok(InvocationResult::Discarded { session_id, error });
        }

        let session = Session::new(session_id, pipeline.id(), outcomes);

        // The previous session must be read before this one replaces it.
        let previous = match self.cache.get(pipeline.id()).await {
            Ok(previous) => previous,
            Err(e) => {
                warn!(pipeline_id = pipeline.id(), "Previous session unavailable: {e}");
                None
            }
        };
        if let Err(e) =
            self.cache.put(pipeline.id(), session.without_bodies(), pipeline.scheduling.session_ttl()).await
        {
            warn!(pipeline_id = pipeline.id(), "Failed to cache session: {e}");
        }

        let diff = match self.diff.compare(&pipeline, previous.as_ref(), &session).await {
            Ok(diff) => Some(diff),
            Err(e) => {
                error!(pipeline_id = pipeline.id(), session_id = %session_id, "State diff failed: {e:#}");
                None
            }
        };
        debug!(pipeline_id = pipeline.id(), session_id = %session_id, success = session.is_success(), "Invocation finished");

        Ok(InvocationResult::Completed { session, diff })
    }
}

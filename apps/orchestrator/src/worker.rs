//! Worker assembly.
//!
//! Builds the broker, handlers, coordinator and every background loop from
//! the storage and transport seams, then runs them until cancelled.

use std::sync::Arc;
use std::time::Duration;

use probe_agent::{AgentClient, ProbeKind};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::diff::DiffEngine;
use crate::dispatch::{InvocationDispatcher, PipelinePeriodicProvider};
use crate::fanout::{FanOutCoordinator, QueueOutcomeSink};
use crate::handlers::{
    NotificationHandler, ProbeTaskHandler, StatsAggregator, StatsBulkWriteHandler, StatsWriteHandler,
};
use crate::heartbeat::{HeartbeatConfig, HeartbeatReconciler};
use crate::metrics::{Metrics, StatsSampler};
use crate::notify::{NotificationSink, QueueNotificationDispatcher};
use crate::probe::{PipelineExecutor, family_for};
use crate::queue::task::{
    STATS_GROUP, TYPE_NOTIFICATION_SEND, TYPE_STATS_BULK_WRITE, TYPE_STATS_WRITE, probe_task_type,
};
use crate::queue::{BrokerConfig, MemoryBroker, PeriodicTaskManager, QueueServer, ServeMux, ServerConfig};
use crate::registry::DatacenterRegistry;
use crate::retention::{RetentionCleanup, RetentionPolicy};
use crate::session::MemorySessionCache;
use crate::store::{PipelineStore, StatsStore};

/// External collaborators of a worker
#[derive(Clone)]
pub struct WorkerDeps {
    pub registry: Arc<dyn DatacenterRegistry>,
    pub pipelines: Arc<dyn PipelineStore>,
    pub stats: Arc<dyn StatsStore>,
    pub agent: Arc<dyn AgentClient>,
    pub sinks: Vec<Arc<dyn NotificationSink>>,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub broker: BrokerConfig,
    pub server: ServerConfig,
    pub heartbeat: HeartbeatConfig,
    pub retention: RetentionPolicy,
    pub body_budget: usize,
    pub periodic_sync_interval: Duration,
    pub maintenance_interval: Duration,
    pub stats_sample_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            broker: config.queue.broker_config(&config.aggregation),
            server: config.queue.server_config(),
            heartbeat: config.heartbeat.heartbeat_config(),
            retention: config.retention.policy(),
            body_budget: config.executor.body_budget_bytes,
            periodic_sync_interval: Duration::from_secs(config.periodic.sync_interval_secs.max(1)),
            maintenance_interval: Duration::from_millis(config.queue.maintenance_interval_ms.max(10)),
            stats_sample_interval: Duration::from_secs(config.queue.stats_sample_interval_secs.max(1)),
        }
    }
}

/// Register one handler per task type on a new mux
pub fn build_mux(
    deps: &WorkerDeps,
    coordinator: Arc<FanOutCoordinator>,
    metrics: Arc<Metrics>,
) -> ServeMux {
    let mut mux = ServeMux::new();
    for kind in ProbeKind::ALL {
        let handler =
            ProbeTaskHandler::new(family_for(kind), deps.pipelines.clone(), coordinator.clone(), metrics.clone());
        mux.handle(probe_task_type(kind), Arc::new(handler));
    }
    mux.handle(TYPE_STATS_WRITE, Arc::new(StatsWriteHandler::new(deps.stats.clone())))
        .handle(TYPE_STATS_BULK_WRITE, Arc::new(StatsBulkWriteHandler::new(deps.stats.clone())))
        .handle(TYPE_NOTIFICATION_SEND, Arc::new(NotificationHandler::new(deps.sinks.clone())));
    mux
}

pub struct Worker {
    broker: Arc<MemoryBroker>,
    server: QueueServer,
    periodic: PeriodicTaskManager,
    heartbeat: HeartbeatReconciler,
    sampler: StatsSampler,
    retention: RetentionCleanup,
    cache: Arc<MemorySessionCache>,
    dispatcher: Arc<InvocationDispatcher>,
    settings: WorkerSettings,
}

impl Worker {
    pub fn build(deps: WorkerDeps, settings: WorkerSettings, metrics: Arc<Metrics>) -> Self {
        let broker = Arc::new(
            MemoryBroker::new(settings.broker.clone()).with_aggregator(STATS_GROUP, Arc::new(StatsAggregator)),
        );

        let cache = Arc::new(MemorySessionCache::new());
        let executor = Arc::new(PipelineExecutor::new(deps.agent.clone(), deps.pipelines.clone(), settings.body_budget));
        let notifications = Arc::new(QueueNotificationDispatcher::new(broker.clone()));
        let diff = Arc::new(DiffEngine::new(deps.registry.clone(), notifications));
        let coordinator = Arc::new(FanOutCoordinator::new(
            deps.registry.clone(),
            executor,
            Arc::new(QueueOutcomeSink::new(broker.clone())),
            cache.clone(),
            diff,
        ));

        let mux = build_mux(&deps, coordinator, metrics.clone());
        let server = QueueServer::new(broker.clone(), mux, settings.server.clone());
        let dispatcher = Arc::new(InvocationDispatcher::new(broker.clone()));
        let periodic = PeriodicTaskManager::new(
            Arc::new(PipelinePeriodicProvider::new(deps.pipelines.clone())),
            broker.clone(),
            settings.periodic_sync_interval,
        );
        let heartbeat = HeartbeatReconciler::new(
            deps.pipelines.clone(),
            dispatcher.clone(),
            broker.clone(),
            metrics.clone(),
            settings.heartbeat,
        );
        let sampler = StatsSampler::new(broker.clone(), metrics, settings.stats_sample_interval);
        let retention = RetentionCleanup::new(deps.stats, settings.retention.clone());

        Self { broker, server, periodic, heartbeat, sampler, retention, cache, dispatcher, settings }
    }

    pub fn broker(&self) -> Arc<MemoryBroker> {
        self.broker.clone()
    }

    /// Entry point for manual invocations
    pub fn dispatcher(&self) -> Arc<InvocationDispatcher> {
        self.dispatcher.clone()
    }

    /// Run every loop until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        let worker = Arc::new(self);
        let mut loops = JoinSet::new();

        let w = worker.clone();
        let c = cancel.clone();
        loops.spawn(async move { w.server.run(c).await });

        loops.spawn(worker.broker.clone().run_maintenance(worker.settings.maintenance_interval, cancel.clone()));

        let w = worker.clone();
        let c = cancel.clone();
        loops.spawn(async move { w.periodic.run(c).await });

        let w = worker.clone();
        let c = cancel.clone();
        loops.spawn(async move { w.heartbeat.run(c).await });

        let w = worker.clone();
        let c = cancel.clone();
        loops.spawn(async move { w.sampler.run(c).await });

        let w = worker.clone();
        let c = cancel.clone();
        loops.spawn(async move { w.retention.run(c).await });

        let w = worker.clone();
        let c = cancel.clone();
        loops.spawn(async move { evict_sessions(&w.cache, w.settings.maintenance_interval * 20, c).await });

        info!("Worker started ({} background loops)", loops.len());
        cancel.cancelled().await;
        worker.broker.close();

        while let Some(result) = loops.join_next().await {
            if let Err(e) = result {
                error!("Worker loop ended abnormally: {e}");
            }
        }
        info!("Worker stopped");
    }
}

async fn evict_sessions(cache: &MemorySessionCache, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let evicted = cache.evict_expired().await;
                if evicted > 0 {
                    tracing::debug!(evicted, "Evicted expired sessions");
                }
            }
        }
    }
}

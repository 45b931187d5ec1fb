//! Task dispatch: ad-hoc invocations and the periodic schedule of every
//! active pipeline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::QueueError;
use crate::models::{InvocationPayload, PipelineConfig, Trigger};
use crate::queue::task::{QUEUE_CRITICAL, QUEUE_DEFAULT, probe_task_type};
use crate::queue::{
    CronSpec, EnqueueOptions, PeriodicTaskConfig, PeriodicTaskConfigProvider, Task, TaskInfo,
    TaskQueue,
};
use crate::store::PipelineStore;

const INVOCATION_MAX_RETRY: u32 = 3;
const INVOCATION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Queue an invocation lands on: callers waiting on a result go first
pub fn queue_for(trigger: Trigger) -> &'static str {
    match trigger {
        Trigger::Manual | Trigger::Heartbeat => QUEUE_CRITICAL,
        Trigger::Scheduled => QUEUE_DEFAULT,
    }
}

pub fn invocation_options(trigger: Trigger) -> EnqueueOptions {
    EnqueueOptions::default()
        .queue(queue_for(trigger))
        .max_retry(INVOCATION_MAX_RETRY)
        .timeout(INVOCATION_TIMEOUT)
}

pub fn invocation_task(payload: &InvocationPayload) -> Result<Task, serde_json::Error> {
    Task::json(probe_task_type(payload.kind), payload)
}

/// Immediate, one-off invocations
pub struct InvocationDispatcher {
    queue: Arc<dyn TaskQueue>,
}

impl InvocationDispatcher {
    pub fn new(queue: Arc<dyn TaskQueue>) -> Self {
        Self { queue }
    }

    pub async fn dispatch(&self, payload: InvocationPayload) -> Result<TaskInfo, QueueError> {
        self.dispatch_with(payload, EnqueueOptions::default()).await
    }

    /// Dispatch with a caller supplied task id; other options follow the trigger
    pub async fn dispatch_with(
        &self,
        payload: InvocationPayload,
        overrides: EnqueueOptions,
    ) -> Result<TaskInfo, QueueError> {
        let mut options = invocation_options(payload.trigger);
        options.task_id = overrides.task_id;

        let task = invocation_task(&payload).map_err(|e| QueueError::Encode(e.to_string()))?;
        let info = self.queue.enqueue(task, options).await?;
        tracing::debug!(
            pipeline_id = payload.pipeline_id,
            task_id = %info.id,
            queue = %info.queue,
            "Dispatched {:?} invocation",
            payload.trigger
        );
        Ok(info)
    }
}

/// Periodic entry of one pipeline
pub fn periodic_config(pipeline: &PipelineConfig) -> Result<PeriodicTaskConfig, serde_json::Error> {
    let payload = InvocationPayload::scheduled(pipeline.id(), pipeline.kind);
    Ok(PeriodicTaskConfig {
        cronspec: CronSpec::from_duration_minutes(pipeline.scheduling.effective_duration_minutes()),
        task: invocation_task(&payload)?,
        options: invocation_options(Trigger::Scheduled),
    })
}

/// One periodic config per active pipeline
pub struct PipelinePeriodicProvider {
    pipelines: Arc<dyn PipelineStore>,
}

impl PipelinePeriodicProvider {
    pub fn new(pipelines: Arc<dyn PipelineStore>) -> Self {
        Self { pipelines }
    }
}

#[async_trait]
impl PeriodicTaskConfigProvider for PipelinePeriodicProvider {
    async fn get_configs(&self) -> anyhow::Result<Vec<PeriodicTaskConfig>> {
        let mut pipelines = self.pipelines.get_active_pipelines().await?;
        pipelines.sort_by_key(PipelineConfig::id);
        pipelines
            .iter()
            .map(|pipeline| periodic_config(pipeline).map_err(anyhow::Error::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use probe_agent::ProbeKind;

    use crate::models::Principal;
    use crate::probe::executor::tests::{pipeline, step};
    use crate::queue::broker::{BrokerConfig, MemoryBroker};
    use crate::queue::task::TYPE_PROBE_CURL;
    use crate::store::memory::MemoryPipelineStore;

    #[tokio::test]
    async fn test_manual_runs_carry_their_principal_on_critical() -> anyhow::Result<()> {
        let broker = Arc::new(MemoryBroker::new(BrokerConfig::default()));
        let dispatcher = InvocationDispatcher::new(broker.clone());
        let principal = Principal { account_id: 9, username: Some("ops".into()) };

        let payload = InvocationPayload::new(11, ProbeKind::Curl, Trigger::Manual).on_behalf_of(principal.clone());
        let info = dispatcher.dispatch(payload).await?;
        assert_eq!(info.queue, QUEUE_CRITICAL);
        assert_eq!(info.task_type, TYPE_PROBE_CURL);
        assert_eq!(info.max_retry, INVOCATION_MAX_RETRY);

        let decoded: InvocationPayload = broker.dequeue().unwrap().task.decode().unwrap();
        assert_eq!(decoded.principal, Some(principal));
        assert_eq!(decoded.context().principal_label(), "ops");
        Ok(())
    }

    #[tokio::test]
    async fn test_provider_builds_one_stable_config_per_active_pipeline() -> anyhow::Result<()> {
        let mut heartbeat = pipeline(vec![step("A", "https://t/a")]);
        heartbeat.scheduling.pipeline_id = 2;
        heartbeat.scheduling.is_heart_beat = true;
        heartbeat.scheduling.duration_minutes = 30;

        let mut hourly = pipeline(vec![step("A", "https://t/a")]);
        hourly.scheduling.pipeline_id = 1;
        hourly.scheduling.duration_minutes = 60;

        let mut inactive = pipeline(vec![step("A", "https://t/a")]);
        inactive.scheduling.pipeline_id = 3;
        inactive.scheduling.is_active = false;

        let store = Arc::new(MemoryPipelineStore::with(vec![heartbeat, hourly, inactive]));
        let provider = PipelinePeriodicProvider::new(store);

        let configs = provider.get_configs().await?;
        let specs: Vec<String> = configs.iter().map(|c| c.cronspec.to_string()).collect();
        assert_eq!(specs, vec!["0 */1 * * *", "*/1 * * * *"]);
        assert!(configs.iter().all(|c| c.options.queue == QUEUE_DEFAULT));

        // Payloads carry no timestamp, so a second sync compares equal.
        assert_eq!(provider.get_configs().await?, configs);
        Ok(())
    }
}

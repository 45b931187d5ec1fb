//! Transition event delivery.
//!
//! The diff engine hands events to a [`NotificationDispatcher`]. In the
//! worker the dispatcher only enqueues a `notification:send` task; the task
//! handler then delivers to every configured [`NotificationSink`], so a slow
//! or failing sink never holds up a probe task.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::models::{TransitionEvent, TransitionState};
use crate::queue::task::{QUEUE_CRITICAL, TYPE_NOTIFICATION_SEND};
use crate::queue::{EnqueueOptions, Task, TaskQueue};

#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn send(&self, event: &TransitionEvent) -> anyhow::Result<()>;
}

pub struct QueueNotificationDispatcher {
    queue: Arc<dyn TaskQueue>,
    options: EnqueueOptions,
}

impl QueueNotificationDispatcher {
    pub fn new(queue: Arc<dyn TaskQueue>) -> Self {
        Self { queue, options: EnqueueOptions::default().queue(QUEUE_CRITICAL).max_retry(5) }
    }
}

#[async_trait]
impl NotificationDispatcher for QueueNotificationDispatcher {
    async fn send(&self, event: &TransitionEvent) -> anyhow::Result<()> {
        let task = Task::json(TYPE_NOTIFICATION_SEND, event)?;
        self.queue.enqueue(task, self.options.clone()).await?;
        Ok(())
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, event: &TransitionEvent) -> anyhow::Result<()>;
}

/// POSTs the event as JSON
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url: url.into() })
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, event: &TransitionEvent) -> anyhow::Result<()> {
        self.client.post(&self.url).json(event).send().await?.error_for_status()?;
        Ok(())
    }
}

/// Writes events to the log
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, event: &TransitionEvent) -> anyhow::Result<()> {
        match event.state {
            TransitionState::Up => info!(pipeline_id = event.pipeline_id, "{}", event.summary()),
            TransitionState::Down | TransitionState::Diff => {
                warn!(pipeline_id = event.pipeline_id, root_cause = ?event.root_cause, "{}", event.summary())
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    use chrono::Utc;
    use probe_agent::ProbeKind;

    use crate::models::DatacenterRef;
    use crate::queue::broker::{BrokerConfig, MemoryBroker};

    /// Keeps every event it is given
    #[derive(Default)]
    pub(crate) struct RecordingDispatcher {
        pub(crate) events: Mutex<Vec<TransitionEvent>>,
    }

    impl RecordingDispatcher {
        pub(crate) fn events(&self) -> Vec<TransitionEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NotificationDispatcher for RecordingDispatcher {
        async fn send(&self, event: &TransitionEvent) -> anyhow::Result<()> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    pub(crate) fn event(state: TransitionState) -> TransitionEvent {
        TransitionEvent {
            kind: ProbeKind::Curl,
            state,
            pipeline_id: 5,
            pipeline_name: "api".into(),
            project_id: 1,
            address: "https://api.example.com".into(),
            root_cause: None,
            resolved_datacenters: vec![],
            failed_datacenters: vec![DatacenterRef { id: 1, title: Some("Frankfurt".into()) }],
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_queue_dispatcher_enqueues_on_critical() -> anyhow::Result<()> {
        let broker = Arc::new(MemoryBroker::new(BrokerConfig::default()));
        let dispatcher = QueueNotificationDispatcher::new(broker.clone());
        dispatcher.send(&event(TransitionState::Down)).await?;

        let lease = broker.dequeue().unwrap();
        assert_eq!(lease.queue, QUEUE_CRITICAL);
        assert_eq!(lease.task.task_type(), TYPE_NOTIFICATION_SEND);
        let decoded: TransitionEvent = lease.task.decode().unwrap();
        assert_eq!(decoded.state, TransitionState::Down);
        assert_eq!(decoded.failed_datacenters[0].id, 1);
        Ok(())
    }
}

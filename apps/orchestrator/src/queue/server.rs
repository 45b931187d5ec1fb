//! Consumer pool: dequeues tasks and runs their handlers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::broker::{Lease, MemoryBroker};
use super::task::Task;
use crate::error::TaskError;

/// What a handler knows about the task it runs
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: String,
    pub queue: String,
    pub retried: u32,
    pub max_retry: u32,
    /// Cancelled when the server shuts down
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn process(&self, ctx: &TaskContext, task: &Task) -> Result<(), TaskError>;
}

/// Routes tasks to handlers by task type
#[derive(Default, Clone)]
pub struct ServeMux {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl ServeMux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&mut self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) -> &mut Self {
        self.handlers.insert(task_type.into(), handler);
        self
    }

    pub fn task_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub async fn dispatch(&self, ctx: &TaskContext, task: &Task) -> Result<(), TaskError> {
        match self.handlers.get(task.task_type()) {
            Some(handler) => handler.process(ctx, task).await,
            None => Err(TaskError::skip_retry(format!(
                "no handler registered for task type {}",
                task.task_type()
            ))),
        }
    }
}

/// Exponential backoff with jitter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Fraction of the delay randomised, 0.0 to 1.0
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { base: Duration::from_secs(1), cap: Duration::from_secs(10 * 60), jitter: 0.2 }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retried + 1`
    pub fn delay(&self, retried: u32) -> Duration {
        let exponential = self.base.saturating_mul(2u32.saturating_pow(retried.min(31)));
        let delay = exponential.min(self.cap);

        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=1.0);
        delay.mul_f64(factor)
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub concurrency: usize,
    /// Fallback poll when no enqueue notification arrives
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
    /// How long shutdown waits for running handlers
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            concurrency: 100,
            poll_interval: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            shutdown_timeout: Duration::from_secs(8),
        }
    }
}

pub struct QueueServer {
    broker: Arc<MemoryBroker>,
    mux: Arc<ServeMux>,
    config: ServerConfig,
}

impl QueueServer {
    pub fn new(broker: Arc<MemoryBroker>, mux: ServeMux, config: ServerConfig) -> Self {
        Self { broker, mux: Arc::new(mux), config }
    }

    /// Consume tasks until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        let permits = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut running = JoinSet::new();
        info!("Queue server started with concurrency {}", self.config.concurrency);

        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let lease = loop {
                if let Some(lease) = self.broker.dequeue() {
                    break Some(lease);
                }
                tokio::select! {
                    _ = cancel.cancelled() => break None,
                    _ = self.broker.wait_for_work() => {}
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            };
            let Some(lease) = lease else { break };

            let broker = self.broker.clone();
            let mux = self.mux.clone();
            let retry = self.config.retry;
            let cancel = cancel.child_token();
            running.spawn(async move {
                process_lease(&broker, &mux, retry, lease, cancel).await;
                drop(permit);
            });

            // Reap finished handlers so the set does not grow unbounded.
            while let Some(result) = running.try_join_next() {
                if let Err(e) = result {
                    error!("Task handler panicked: {e}");
                }
            }
        }

        info!("Queue server stopping, waiting for {} running tasks", running.len());
        let drained = tokio::time::timeout(self.config.shutdown_timeout, async {
            while running.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Shutdown timeout reached, aborting remaining tasks");
            running.abort_all();
        }
    }

    /// Run one ready task, if any; used by tests and one-shot tooling
    pub async fn process_next(&self) -> bool {
        match self.broker.dequeue() {
            Some(lease) => {
                process_lease(&self.broker, &self.mux, self.config.retry, lease, CancellationToken::new())
                    .await;
                true
            }
            None => false,
        }
    }
}

async fn process_lease(
    broker: &MemoryBroker,
    mux: &ServeMux,
    retry: RetryPolicy,
    lease: Lease,
    cancel: CancellationToken,
) {
    let ctx = TaskContext {
        task_id: lease.id.clone(),
        queue: lease.queue.clone(),
        retried: lease.retried,
        max_retry: lease.max_retry,
        cancel,
    };
    let started = Instant::now();

    let result = match tokio::time::timeout(lease.timeout, mux.dispatch(&ctx, &lease.task)).await {
        Ok(result) => result,
        Err(_) => Err(TaskError::retry(anyhow::anyhow!(
            "task exceeded its timeout of {:?}",
            lease.timeout
        ))),
    };

    match result {
        Ok(()) => {
            debug!(
                task_id = %lease.id,
                task_type = lease.task.task_type(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Task completed"
            );
            broker.complete(&lease.id);
        }
        Err(TaskError::SkipRetry(reason)) => {
            warn!(task_id = %lease.id, task_type = lease.task.task_type(), "Task archived without retry: {reason}");
            broker.fail(&lease.id, &reason, None);
        }
        Err(TaskError::Retry(e)) => {
            let delay = retry.delay(lease.retried);
            let state = broker.fail(&lease.id, &format!("{e:#}"), Some(delay));
            warn!(
                task_id = %lease.id,
                task_type = lease.task.task_type(),
                retried = lease.retried,
                "Task failed ({e:#}), now {}",
                state.map(|s| s.to_string()).unwrap_or_else(|| "gone".to_string())
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::queue::broker::BrokerConfig;
    use crate::queue::task::{EnqueueOptions, QUEUE_DEFAULT, TaskState};
    use crate::queue::{Inspector, TaskQueue};

    struct Scripted {
        calls: AtomicUsize,
        result: fn() -> Result<(), TaskError>,
    }

    #[async_trait]
    impl TaskHandler for Scripted {
        async fn process(&self, _ctx: &TaskContext, _task: &Task) -> Result<(), TaskError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.result)()
        }
    }

    fn server(handler: Arc<Scripted>) -> (Arc<MemoryBroker>, QueueServer) {
        let broker = Arc::new(MemoryBroker::new(BrokerConfig::default()));
        let mut mux = ServeMux::new();
        mux.handle("test:task", handler);
        let config = ServerConfig {
            retry: RetryPolicy { base: Duration::from_secs(1), cap: Duration::from_secs(4), jitter: 0.0 },
            ..Default::default()
        };
        (broker.clone(), QueueServer::new(broker, mux, config))
    }

    #[test]
    fn test_backoff_doubles_up_to_the_cap() {
        let policy = RetryPolicy { base: Duration::from_secs(1), cap: Duration::from_secs(10), jitter: 0.0 };
        let delays: Vec<u64> = (0..6).map(|n| policy.delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(10));

        let jittered = RetryPolicy { jitter: 0.5, ..policy };
        for _ in 0..50 {
            let delay = jittered.delay(2);
            assert!(delay >= Duration::from_secs(2) && delay <= Duration::from_secs(4));
        }
    }

    #[tokio::test]
    async fn test_skip_retry_is_consumed_once() -> anyhow::Result<()> {
        let handler = Arc::new(Scripted {
            calls: AtomicUsize::new(0),
            result: || Err(TaskError::skip_retry("bad payload")),
        });
        let (broker, server) = server(handler.clone());
        let info = broker.enqueue(Task::new("test:task", vec![]), EnqueueOptions::default()).await?;

        assert!(server.process_next().await);
        assert!(!server.process_next().await);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        let info = broker.get_task_info(QUEUE_DEFAULT, &info.id).await?;
        assert_eq!(info.state, TaskState::Archived);
        assert_eq!(info.retried, 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failures_back_off_until_max_retry() -> anyhow::Result<()> {
        let handler = Arc::new(Scripted {
            calls: AtomicUsize::new(0),
            result: || Err(TaskError::retry(anyhow::anyhow!("database is locked"))),
        });
        let (broker, server) = server(handler.clone());
        let info = broker
            .enqueue(Task::new("test:task", vec![]), EnqueueOptions::default().max_retry(2))
            .await?;

        assert!(server.process_next().await);
        assert!(!server.process_next().await);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(server.process_next().await);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(server.process_next().await);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!server.process_next().await);

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        let info = broker.get_task_info(QUEUE_DEFAULT, &info.id).await?;
        assert_eq!(info.state, TaskState::Archived);
        assert_eq!(info.retried, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_task_type_is_archived() -> anyhow::Result<()> {
        let handler = Arc::new(Scripted { calls: AtomicUsize::new(0), result: || Ok(()) });
        let (broker, server) = server(handler);
        let info = broker.enqueue(Task::new("other:task", vec![]), EnqueueOptions::default()).await?;

        server.process_next().await;
        let info = broker.get_task_info(QUEUE_DEFAULT, &info.id).await?;
        assert_eq!(info.state, TaskState::Archived);
        assert!(info.last_error.unwrap().contains("no handler"));
        Ok(())
    }

    #[tokio::test]
    async fn test_run_processes_until_cancelled() -> anyhow::Result<()> {
        let handler = Arc::new(Scripted { calls: AtomicUsize::new(0), result: || Ok(()) });
        let (broker, server) = server(handler.clone());
        for _ in 0..5 {
            broker.enqueue(Task::new("test:task", vec![]), EnqueueOptions::default()).await?;
        }

        let cancel = CancellationToken::new();
        let server = Arc::new(server);
        let running = tokio::spawn({
            let server = server.clone();
            let cancel = cancel.clone();
            async move { server.run(cancel).await }
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            while handler.calls.load(Ordering::SeqCst) < 5 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await?;

        cancel.cancel();
        running.await?;
        assert_eq!(broker.stats().queue(QUEUE_DEFAULT).unwrap().completed, 5);
        Ok(())
    }
}

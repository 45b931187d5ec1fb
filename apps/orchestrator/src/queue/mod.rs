//! Task queue: priority queues with retries, group aggregation, a consumer
//! pool and periodic scheduling.

pub mod aggregation;
pub mod broker;
pub mod cron;
pub mod periodic;
pub mod server;
pub mod task;

use async_trait::async_trait;

use crate::error::QueueError;

pub use aggregation::{GroupAggregator, GroupPolicy};
pub use broker::{BrokerConfig, BrokerStats, MemoryBroker};
pub use cron::CronSpec;
pub use periodic::{PeriodicTaskConfig, PeriodicTaskConfigProvider, PeriodicTaskManager};
pub use server::{QueueServer, RetryPolicy, ServeMux, ServerConfig, TaskContext, TaskHandler};
pub use task::{EnqueueOptions, Task, TaskInfo, TaskState};

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: Task, options: EnqueueOptions) -> Result<TaskInfo, QueueError>;
}

#[async_trait]
pub trait Inspector: Send + Sync {
    async fn get_task_info(&self, queue: &str, id: &str) -> Result<TaskInfo, QueueError>;

    /// Remove a task that is not running
    async fn delete_task(&self, queue: &str, id: &str) -> Result<(), QueueError>;
}

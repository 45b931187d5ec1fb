//! Task envelope, enqueue options and the task types this engine consumes.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use probe_agent::ProbeKind;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::TaskError;

pub const QUEUE_CRITICAL: &str = "critical";
pub const QUEUE_DEFAULT: &str = "default";
pub const QUEUE_LOW: &str = "low";

pub const TYPE_PROBE_CURL: &str = "probe:curl";
pub const TYPE_PROBE_NETCAT: &str = "probe:netcat";
pub const TYPE_PROBE_PING: &str = "probe:ping";
pub const TYPE_PROBE_TRACEROUTE: &str = "probe:traceroute";
pub const TYPE_PROBE_PAGESPEED: &str = "probe:pagespeed";
pub const TYPE_STATS_WRITE: &str = "stats:write";
pub const TYPE_STATS_BULK_WRITE: &str = "stats:bulk_write";
pub const TYPE_NOTIFICATION_SEND: &str = "notification:send";

/// Group that collects every `stats:write` task for bulk insertion
pub const STATS_GROUP: &str = "stats";

pub const DEFAULT_MAX_RETRY: u32 = 25;
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(30 * 60);

pub fn probe_task_type(kind: ProbeKind) -> &'static str {
    match kind {
        ProbeKind::Curl => TYPE_PROBE_CURL,
        ProbeKind::NetCat => TYPE_PROBE_NETCAT,
        ProbeKind::Ping => TYPE_PROBE_PING,
        ProbeKind::TraceRoute => TYPE_PROBE_TRACEROUTE,
        ProbeKind::PageSpeed => TYPE_PROBE_PAGESPEED,
    }
}

/// Reverse of [`probe_task_type`]
pub fn probe_kind_of(task_type: &str) -> Option<ProbeKind> {
    ProbeKind::ALL.into_iter().find(|kind| probe_task_type(*kind) == task_type)
}

/// A unit of work: a type routing it to a handler and an opaque payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    task_type: String,
    payload: Vec<u8>,
}

impl Task {
    pub fn new(task_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self { task_type: task_type.into(), payload }
    }

    /// Task carrying `value` as JSON
    pub fn json<T: Serialize>(task_type: impl Into<String>, value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(task_type, serde_json::to_vec(value)?))
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Decode the JSON payload; a payload that does not decode is never retried
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, TaskError> {
        serde_json::from_slice(&self.payload).map_err(|e| {
            TaskError::skip_retry(format!("malformed {} payload: {e}", self.task_type))
        })
    }
}

/// Per-enqueue options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub queue: String,
    /// Caller supplied id; a UUID is generated when absent
    pub task_id: Option<String>,
    pub max_retry: u32,
    pub timeout: Duration,
    /// Aggregation group the task joins instead of becoming pending
    pub group: Option<String>,
    pub process_in: Option<Duration>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            queue: QUEUE_DEFAULT.to_string(),
            task_id: None,
            max_retry: DEFAULT_MAX_RETRY,
            timeout: DEFAULT_TASK_TIMEOUT,
            group: None,
            process_in: None,
        }
    }
}

impl EnqueueOptions {
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn task_id(mut self, id: impl Into<String>) -> Self {
        self.task_id = Some(id.into());
        self
    }

    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn process_in(mut self, delay: Duration) -> Self {
        self.process_in = Some(delay);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Pending,
    Scheduled,
    Active,
    Retry,
    /// Buffered in an aggregation group
    Aggregating,
    Completed,
    Archived,
}

impl TaskState {
    /// Completed or archived: nothing will run this task again
    pub fn is_finished(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Archived)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Pending => "pending",
            TaskState::Scheduled => "scheduled",
            TaskState::Active => "active",
            TaskState::Retry => "retry",
            TaskState::Aggregating => "aggregating",
            TaskState::Completed => "completed",
            TaskState::Archived => "archived",
        };
        f.write_str(name)
    }
}

/// Inspector view of a task
#[derive(Debug, Clone, PartialEq)]
pub struct TaskInfo {
    pub id: String,
    pub queue: String,
    pub task_type: String,
    pub payload: Vec<u8>,
    pub state: TaskState,
    pub retried: u32,
    pub max_retry: u32,
    pub last_error: Option<String>,
    pub group: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InvocationPayload, Trigger};

    #[test]
    fn test_probe_task_types_round_trip() {
        for kind in ProbeKind::ALL {
            assert_eq!(probe_kind_of(probe_task_type(kind)), Some(kind));
        }
        assert_eq!(probe_kind_of(TYPE_STATS_WRITE), None);
    }

    #[test]
    fn test_malformed_payload_is_skip_retry() {
        let task = Task::new(TYPE_PROBE_CURL, b"{not json".to_vec());
        let err = task.decode::<InvocationPayload>().unwrap_err();
        assert!(err.is_terminal());

        let task =
            Task::json(TYPE_PROBE_CURL, &InvocationPayload::new(4, ProbeKind::Curl, Trigger::Manual))
                .unwrap();
        assert_eq!(task.decode::<InvocationPayload>().unwrap().pipeline_id, 4);
    }
}

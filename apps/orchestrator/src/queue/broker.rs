//! In-process task broker.
//!
//! Weighted priority queues, delayed and retried tasks, group aggregation,
//! a task inspector and per-queue / per-type statistics. State lives behind
//! one mutex that is never held across an await point.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::aggregation::{AggregationSet, Flush, GroupAggregator, GroupPolicy};
use super::task::{
    EnqueueOptions, QUEUE_CRITICAL, QUEUE_DEFAULT, QUEUE_LOW, Task, TaskInfo, TaskState,
};
use super::{Inspector, TaskQueue};
use crate::error::QueueError;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Queue name and relative weight
    pub queues: Vec<(String, u32)>,
    pub group_policy: GroupPolicy,
    /// How long completed tasks stay visible to the inspector
    pub completed_retention: Duration,
    pub archived_retention: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            queues: vec![
                (QUEUE_CRITICAL.to_string(), 6),
                (QUEUE_DEFAULT.to_string(), 3),
                (QUEUE_LOW.to_string(), 1),
            ],
            group_policy: GroupPolicy::default(),
            completed_retention: Duration::from_secs(5 * 60),
            archived_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// A dequeued task, owned by one consumer until reported back
#[derive(Debug, Clone)]
pub struct Lease {
    pub id: String,
    pub queue: String,
    pub task: Task,
    pub retried: u32,
    pub max_retry: u32,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub name: String,
    pub pending: usize,
    pub active: usize,
    pub scheduled: usize,
    pub retry: usize,
    pub aggregating: usize,
    pub completed: usize,
    pub archived: usize,
    /// Wait time of the oldest pending task
    pub latency: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskTypeStats {
    pub task_type: String,
    pub pending: usize,
    pub active: usize,
    pub processed: u64,
    pub failed: u64,
    /// Handler run time of the most recent completion
    pub last_duration: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub queues: Vec<QueueStats>,
    pub task_types: Vec<TaskTypeStats>,
}

impl BrokerStats {
    pub fn queue(&self, name: &str) -> Option<&QueueStats> {
        self.queues.iter().find(|q| q.name == name)
    }

    pub fn task_type(&self, task_type: &str) -> Option<&TaskTypeStats> {
        self.task_types.iter().find(|t| t.task_type == task_type)
    }
}

struct TaskRecord {
    info: TaskInfo,
    timeout: Duration,
    ready_at: Instant,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
}

struct QueueState {
    weight: u32,
    ready: VecDeque<String>,
    groups: AggregationSet<String>,
}

#[derive(Default)]
struct TypeCounters {
    processed: u64,
    failed: u64,
    last_duration: Option<Duration>,
}

struct BrokerState {
    queues: BTreeMap<String, QueueState>,
    tasks: HashMap<String, TaskRecord>,
    counters: HashMap<String, TypeCounters>,
    closed: bool,
}

pub struct MemoryBroker {
    config: BrokerConfig,
    state: Mutex<BrokerState>,
    aggregators: HashMap<String, Arc<dyn GroupAggregator>>,
    notify: Notify,
}

impl MemoryBroker {
    pub fn new(config: BrokerConfig) -> Self {
        let queues = config
            .queues
            .iter()
            .map(|(name, weight)| {
                let state = QueueState {
                    weight: (*weight).max(1),
                    ready: VecDeque::new(),
                    groups: AggregationSet::new(config.group_policy),
                };
                (name.clone(), state)
            })
            .collect();

        Self {
            config,
            state: Mutex::new(BrokerState {
                queues,
                tasks: HashMap::new(),
                counters: HashMap::new(),
                closed: false,
            }),
            aggregators: HashMap::new(),
            notify: Notify::new(),
        }
    }

    /// Register the aggregator releasing tasks of `group`
    pub fn with_aggregator(mut self, group: &str, aggregator: Arc<dyn GroupAggregator>) -> Self {
        self.aggregators.insert(group.to_string(), aggregator);
        self
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // A poisoned lock only means a panic elsewhere; the state stays usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Resolves once new work may be available
    pub async fn wait_for_work(&self) {
        self.notify.notified().await
    }

    /// Stop accepting tasks
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Take the next ready task, choosing the queue by weight
    pub fn dequeue(&self) -> Option<Lease> {
        let now = Instant::now();
        let mut state = self.lock();
        promote_due(&mut state, now);

        let candidates: Vec<(String, u32)> = state
            .queues
            .iter()
            .filter(|(_, queue)| !queue.ready.is_empty())
            .map(|(name, queue)| (name.clone(), queue.weight))
            .collect();
        let queue_name = pick_weighted(&candidates)?;

        loop {
            let id = state.queues.get_mut(&queue_name)?.ready.pop_front()?;
            // Deleted tasks leave stale ids behind.
            let Some(record) = state.tasks.get_mut(&id) else { continue };
            if record.info.state != TaskState::Pending {
                continue;
            }
            record.info.state = TaskState::Active;
            record.started_at = Some(now);

            return Some(Lease {
                id,
                queue: queue_name,
                task: Task::new(record.info.task_type.clone(), record.info.payload.clone()),
                retried: record.info.retried,
                max_retry: record.info.max_retry,
                timeout: record.timeout,
            });
        }
    }

    /// Report a successful run
    pub fn complete(&self, id: &str) {
        let now = Instant::now();
        let mut state = self.lock();
        let Some(record) = state.tasks.get_mut(id) else { return };

        record.info.state = TaskState::Completed;
        record.info.completed_at = Some(Utc::now());
        record.finished_at = Some(now);
        let duration = record.started_at.map(|started| now.saturating_duration_since(started));
        let task_type = record.info.task_type.clone();

        let counters = state.counters.entry(task_type).or_default();
        counters.processed += 1;
        counters.last_duration = duration;
    }

    /// Report a failed run; `retry_in` reschedules, `None` archives
    pub fn fail(&self, id: &str, error: &str, retry_in: Option<Duration>) -> Option<TaskState> {
        let now = Instant::now();
        let mut state = self.lock();
        let record = state.tasks.get_mut(id)?;

        record.info.last_error = Some(error.to_string());
        record.started_at = None;
        let new_state = match retry_in {
            Some(delay) if record.info.retried < record.info.max_retry => {
                record.info.retried += 1;
                record.ready_at = now + delay;
                TaskState::Retry
            }
            _ => {
                record.finished_at = Some(now);
                TaskState::Archived
            }
        };
        record.info.state = new_state;
        let task_type = record.info.task_type.clone();

        let counters = state.counters.entry(task_type).or_default();
        counters.processed += 1;
        counters.failed += 1;
        Some(new_state)
    }

    /// Release due aggregation groups; returns how many aggregate tasks were created
    pub fn flush_groups(&self) -> usize {
        let now = Instant::now();
        let mut state = self.lock();

        let mut flushes = Vec::new();
        for (queue_name, queue) in state.queues.iter_mut() {
            flushes.extend(queue.groups.take_due(now).into_iter().map(|f| (queue_name.clone(), f)));
        }

        let created = flushes.len();
        for (queue_name, flush) in flushes {
            self.release_group(&mut state, &queue_name, flush, now);
        }
        if created > 0 {
            self.notify.notify_one();
        }
        created
    }

    /// Drop finished tasks past their retention; returns how many were removed
    pub fn purge_finished(&self) -> usize {
        let now = Instant::now();
        let mut state = self.lock();
        let before = state.tasks.len();
        let completed_retention = self.config.completed_retention;
        let archived_retention = self.config.archived_retention;

        state.tasks.retain(|_, record| {
            let retention = match record.info.state {
                TaskState::Completed => completed_retention,
                TaskState::Archived => archived_retention,
                _ => return true,
            };
            record
                .finished_at
                .is_none_or(|finished| now.saturating_duration_since(finished) < retention)
        });
        before - state.tasks.len()
    }

    pub fn stats(&self) -> BrokerStats {
        let now = Instant::now();
        let state = self.lock();

        let mut queues: BTreeMap<&str, QueueStats> = state
            .queues
            .keys()
            .map(|name| (name.as_str(), QueueStats { name: name.clone(), ..Default::default() }))
            .collect();
        let mut types: BTreeMap<&str, TaskTypeStats> = BTreeMap::new();

        for record in state.tasks.values() {
            let Some(queue) = queues.get_mut(record.info.queue.as_str()) else { continue };
            let by_type = types.entry(record.info.task_type.as_str()).or_insert_with(|| {
                TaskTypeStats { task_type: record.info.task_type.clone(), ..Default::default() }
            });

            match record.info.state {
                TaskState::Pending => {
                    queue.pending += 1;
                    by_type.pending += 1;
                    queue.latency = queue.latency.max(now.saturating_duration_since(record.ready_at));
                }
                TaskState::Active => {
                    queue.active += 1;
                    by_type.active += 1;
                }
                TaskState::Scheduled => queue.scheduled += 1,
                TaskState::Retry => queue.retry += 1,
                TaskState::Aggregating => queue.aggregating += 1,
                TaskState::Completed => queue.completed += 1,
                TaskState::Archived => queue.archived += 1,
            }
        }

        for (task_type, counters) in &state.counters {
            let by_type = types.entry(task_type.as_str()).or_insert_with(|| TaskTypeStats {
                task_type: task_type.clone(),
                ..Default::default()
            });
            by_type.processed = counters.processed;
            by_type.failed = counters.failed;
            by_type.last_duration = counters.last_duration;
        }

        BrokerStats {
            queues: queues.into_values().collect(),
            task_types: types.into_values().collect(),
        }
    }

    /// Periodically flush aggregation groups and purge finished tasks
    pub async fn run_maintenance(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("Broker maintenance started (every {:?})", interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let flushed = self.flush_groups();
                    let purged = self.purge_finished();
                    if flushed > 0 || purged > 0 {
                        debug!(flushed, purged, "Broker maintenance pass");
                    }
                }
            }
        }
        info!("Broker maintenance stopped");
    }

    fn release_group(
        &self,
        state: &mut BrokerState,
        queue_name: &str,
        flush: Flush<String>,
        now: Instant,
    ) {
        let members: Vec<(String, Task)> = flush
            .items
            .iter()
            .filter_map(|id| {
                let record = state.tasks.get(id)?;
                (record.info.state == TaskState::Aggregating).then(|| {
                    (id.clone(), Task::new(record.info.task_type.clone(), record.info.payload.clone()))
                })
            })
            .collect();
        if members.is_empty() {
            return;
        }

        let Some(aggregator) = self.aggregators.get(&flush.key) else {
            warn!(group = %flush.key, "No aggregator for group, releasing tasks individually");
            for (id, _) in members {
                if let Some(record) = state.tasks.get_mut(&id) {
                    record.info.state = TaskState::Pending;
                    record.ready_at = now;
                }
                if let Some(queue) = state.queues.get_mut(queue_name) {
                    queue.ready.push_back(id);
                }
            }
            return;
        };

        let (ids, tasks): (Vec<String>, Vec<Task>) = members.into_iter().unzip();
        for id in &ids {
            state.tasks.remove(id);
        }

        let aggregate = aggregator.aggregate(&flush.key, tasks);
        debug!(
            group = %flush.key,
            reason = ?flush.reason,
            size = ids.len(),
            "Aggregated group into {}",
            aggregate.task_type()
        );
        let options = EnqueueOptions::default().queue(queue_name);
        insert_ready(state, aggregate, &options, Uuid::new_v4().to_string(), now);
    }
}

fn insert_ready(
    state: &mut BrokerState,
    task: Task,
    options: &EnqueueOptions,
    id: String,
    ready_at: Instant,
) -> TaskInfo {
    let info = TaskInfo {
        id: id.clone(),
        queue: options.queue.clone(),
        task_type: task.task_type().to_string(),
        payload: task.payload().to_vec(),
        state: TaskState::Pending,
        retried: 0,
        max_retry: options.max_retry,
        last_error: None,
        group: None,
        enqueued_at: Utc::now(),
        completed_at: None,
    };
    state.tasks.insert(
        id.clone(),
        TaskRecord {
            info: info.clone(),
            timeout: options.timeout,
            ready_at,
            started_at: None,
            finished_at: None,
        },
    );
    if let Some(queue) = state.queues.get_mut(&options.queue) {
        queue.ready.push_back(id);
    }
    info
}

/// Move scheduled and retry tasks whose time has come onto their queues
fn promote_due(state: &mut BrokerState, now: Instant) {
    let mut due: Vec<(Instant, String, String)> = state
        .tasks
        .iter()
        .filter(|(_, record)| {
            matches!(record.info.state, TaskState::Scheduled | TaskState::Retry)
                && record.ready_at <= now
        })
        .map(|(id, record)| (record.ready_at, id.clone(), record.info.queue.clone()))
        .collect();
    due.sort();

    for (_, id, queue_name) in due {
        if let Some(record) = state.tasks.get_mut(&id) {
            record.info.state = TaskState::Pending;
        }
        if let Some(queue) = state.queues.get_mut(&queue_name) {
            queue.ready.push_back(id);
        }
    }
}

fn pick_weighted(candidates: &[(String, u32)]) -> Option<String> {
    let total: u32 = candidates.iter().map(|(_, weight)| *weight).sum();
    if total == 0 {
        return None;
    }

    let mut roll = rand::thread_rng().gen_range(0..total);
    for (name, weight) in candidates {
        if roll < *weight {
            return Some(name.clone());
        }
        roll -= weight;
    }
    None
}

#[async_trait]
impl TaskQueue for MemoryBroker {
    async fn enqueue(&self, task: Task, options: EnqueueOptions) -> Result<TaskInfo, QueueError> {
        let now = Instant::now();
        let mut state = self.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        if !state.queues.contains_key(&options.queue) {
            return Err(QueueError::UnknownQueue(options.queue.clone()));
        }

        let id = options.task_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        if state.tasks.contains_key(&id) {
            return Err(QueueError::DuplicateTask { queue: options.queue.clone(), id });
        }

        if let Some(group) = options.group.clone() {
            let mut info = insert_ready(&mut state, task, &options, id.clone(), now);
            // insert_ready queued it as pending; move it into the group instead.
            if let Some(queue) = state.queues.get_mut(&options.queue) {
                queue.ready.retain(|queued| queued != &id);
            }
            if let Some(record) = state.tasks.get_mut(&id) {
                record.info.state = TaskState::Aggregating;
                record.info.group = Some(group.clone());
            }
            info.state = TaskState::Aggregating;
            info.group = Some(group.clone());

            let flush = state
                .queues
                .get_mut(&options.queue)
                .and_then(|queue| queue.groups.add(&group, id, now));
            if let Some(flush) = flush {
                self.release_group(&mut state, &options.queue, flush, now);
                self.notify.notify_one();
            }
            return Ok(info);
        }

        if let Some(delay) = options.process_in.filter(|delay| !delay.is_zero()) {
            let mut info = insert_ready(&mut state, task, &options, id.clone(), now + delay);
            if let Some(queue) = state.queues.get_mut(&options.queue) {
                queue.ready.retain(|queued| queued != &id);
            }
            if let Some(record) = state.tasks.get_mut(&id) {
                record.info.state = TaskState::Scheduled;
            }
            info.state = TaskState::Scheduled;
            return Ok(info);
        }

        let info = insert_ready(&mut state, task, &options, id, now);
        drop(state);
        self.notify.notify_one();
        Ok(info)
    }
}

#[async_trait]
impl Inspector for MemoryBroker {
    async fn get_task_info(&self, queue: &str, id: &str) -> Result<TaskInfo, QueueError> {
        let state = self.lock();
        state
            .tasks
            .get(id)
            .filter(|record| record.info.queue == queue)
            .map(|record| record.info.clone())
            .ok_or_else(|| QueueError::TaskNotFound { queue: queue.to_string(), id: id.to_string() })
    }

    async fn delete_task(&self, queue: &str, id: &str) -> Result<(), QueueError> {
        let mut state = self.lock();
        let not_found = || QueueError::TaskNotFound { queue: queue.to_string(), id: id.to_string() };

        let record = state.tasks.get(id).filter(|record| record.info.queue == queue).ok_or_else(not_found)?;
        if record.info.state == TaskState::Active {
            return Err(QueueError::TaskActive { id: id.to_string() });
        }

        state.tasks.remove(id);
        if let Some(queue) = state.queues.get_mut(queue) {
            queue.ready.retain(|queued| queued != id);
        }
        Ok(())
    }
}

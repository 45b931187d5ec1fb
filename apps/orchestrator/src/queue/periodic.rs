//! Periodic task manager.
//!
//! Pulls the wanted set of periodic tasks from a provider on every sync and
//! reinstalls the schedule only when that set changed, so firing times are
//! not reset by unrelated syncs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::TaskQueue;
use super::cron::CronSpec;
use super::task::{EnqueueOptions, Task};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodicTaskConfig {
    pub cronspec: CronSpec,
    pub task: Task,
    pub options: EnqueueOptions,
}

#[async_trait]
pub trait PeriodicTaskConfigProvider: Send + Sync {
    async fn get_configs(&self) -> anyhow::Result<Vec<PeriodicTaskConfig>>;
}

struct Entry {
    config: PeriodicTaskConfig,
    next: Option<DateTime<Utc>>,
}

/// Installed schedule
#[derive(Default)]
pub struct Schedule {
    entries: Vec<Entry>,
}

impl Schedule {
    /// Replace the schedule if `configs` differs; returns whether it did
    pub fn install(&mut self, configs: Vec<PeriodicTaskConfig>, now: DateTime<Utc>) -> bool {
        let unchanged = self.entries.len() == configs.len()
            && self.entries.iter().zip(&configs).all(|(entry, config)| &entry.config == config);
        if unchanged {
            return false;
        }

        self.entries = configs
            .into_iter()
            .map(|config| {
                let next = config.cronspec.next_after(now);
                Entry { config, next }
            })
            .collect();
        true
    }

    /// Configs whose firing time has come; their next firing is advanced
    pub fn take_due(&mut self, now: DateTime<Utc>) -> Vec<PeriodicTaskConfig> {
        let mut due = Vec::new();
        for entry in &mut self.entries {
            if entry.next.is_some_and(|next| next <= now) {
                due.push(entry.config.clone());
                entry.next = entry.config.cronspec.next_after(now);
            }
        }
        due
    }

    pub fn next_firing(&self) -> Option<DateTime<Utc>> {
        self.entries.iter().filter_map(|entry| entry.next).min()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct PeriodicTaskManager {
    provider: Arc<dyn PeriodicTaskConfigProvider>,
    queue: Arc<dyn TaskQueue>,
    sync_interval: Duration,
    schedule: Mutex<Schedule>,
}

impl PeriodicTaskManager {
    pub fn new(
        provider: Arc<dyn PeriodicTaskConfigProvider>,
        queue: Arc<dyn TaskQueue>,
        sync_interval: Duration,
    ) -> Self {
        Self { provider, queue, sync_interval, schedule: Mutex::new(Schedule::default()) }
    }

    /// Refresh the schedule from the provider
    pub async fn sync(&self, now: DateTime<Utc>) -> anyhow::Result<bool> {
        let configs = self.provider.get_configs().await?;
        let count = configs.len();
        let changed = self.schedule.lock().await.install(configs, now);
        if changed {
            info!("Installed {} periodic task(s)", count);
        }
        Ok(changed)
    }

    /// Enqueue every task due at `now`; returns how many were enqueued
    pub async fn fire_due(&self, now: DateTime<Utc>) -> usize {
        let due = self.schedule.lock().await.take_due(now);
        let mut enqueued = 0;
        for config in due {
            match self.queue.enqueue(config.task.clone(), config.options.clone()).await {
                Ok(info) => {
                    debug!(task_id = %info.id, cron = %config.cronspec, "Enqueued periodic {}", config.task.task_type());
                    enqueued += 1;
                }
                Err(e) => warn!(cron = %config.cronspec, "Failed to enqueue periodic {}: {e}", config.task.task_type()),
            }
        }
        enqueued
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut sync_timer = tokio::time::interval(self.sync_interval);
        sync_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("Periodic task manager started (sync every {:?})", self.sync_interval);

        loop {
            let wait = self
                .schedule
                .lock()
                .await
                .next_firing()
                .map(|next| (next - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                .unwrap_or(self.sync_interval);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sync_timer.tick() => {
                    if let Err(e) = self.sync(Utc::now()).await {
                        error!("Periodic task sync failed: {e:#}");
                    }
                }
                _ = tokio::time::sleep(wait) => {
                    self.fire_due(Utc::now()).await;
                }
            }
        }
        info!("Periodic task manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Mutex as StdMutex;

    use crate::queue::broker::{BrokerConfig, MemoryBroker};

    struct FixedProvider {
        configs: StdMutex<Vec<PeriodicTaskConfig>>,
    }

    #[async_trait]
    impl PeriodicTaskConfigProvider for FixedProvider {
        async fn get_configs(&self) -> anyhow::Result<Vec<PeriodicTaskConfig>> {
            Ok(self.configs.lock().unwrap().clone())
        }
    }

    fn config(minutes: u32, name: &str) -> PeriodicTaskConfig {
        PeriodicTaskConfig {
            cronspec: CronSpec::from_duration_minutes(minutes),
            task: Task::new("test:periodic", name.as_bytes().to_vec()),
            options: EnqueueOptions::default(),
        }
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, 0).unwrap()
    }

    #[test]
    fn test_reinstalls_only_on_change() {
        let mut schedule = Schedule::default();
        assert!(schedule.install(vec![config(5, "a")], at(10, 1)));
        assert!(!schedule.install(vec![config(5, "a")], at(10, 2)));
        assert_eq!(schedule.next_firing(), Some(at(10, 5)));

        assert!(schedule.install(vec![config(5, "a"), config(1, "b")], at(10, 2)));
        assert_eq!(schedule.next_firing(), Some(at(10, 3)));
    }

    #[test]
    fn test_due_entries_fire_once_per_slot() {
        let mut schedule = Schedule::default();
        schedule.install(vec![config(5, "a"), config(10, "b")], at(10, 1));

        assert!(schedule.take_due(at(10, 4)).is_empty());
        assert_eq!(schedule.take_due(at(10, 5)).len(), 1);
        assert!(schedule.take_due(at(10, 5)).is_empty());

        let due = schedule.take_due(at(10, 10));
        assert_eq!(due.len(), 2);
    }

    #[tokio::test]
    async fn test_manager_enqueues_due_tasks() -> anyhow::Result<()> {
        let provider = Arc::new(FixedProvider { configs: StdMutex::new(vec![config(5, "a")]) });
        let broker = Arc::new(MemoryBroker::new(BrokerConfig::default()));
        let manager = PeriodicTaskManager::new(provider.clone(), broker.clone(), Duration::from_secs(60));

        assert!(manager.sync(at(10, 1)).await?);
        assert!(!manager.sync(at(10, 2)).await?);
        assert_eq!(manager.fire_due(at(10, 5)).await, 1);
        assert_eq!(broker.dequeue().unwrap().task.payload(), b"a");

        provider.configs.lock().unwrap().clear();
        assert!(manager.sync(at(10, 6)).await?);
        assert_eq!(manager.fire_due(at(10, 10)).await, 0);
        Ok(())
    }
}

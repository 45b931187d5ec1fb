//! Retention of stored probe outcomes.
//!
//! Body snapshots are the bulk of the stats table; past the retention window
//! they are dropped while status, timing and success stay queryable.
//! Cleanup runs periodically (every hour by default) as a background task.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::StatsStore;

/// Retention policy for stored outcomes
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    /// Days to keep body snapshots
    pub body_snapshot_days: i64,
    pub cleanup_interval: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self { body_snapshot_days: 7, cleanup_interval: Duration::from_secs(3600) }
    }
}

impl RetentionPolicy {
    fn body_snapshot_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.body_snapshot_days)
    }
}

/// Cleanup manager for expired body snapshots
pub struct RetentionCleanup {
    store: Arc<dyn StatsStore>,
    policy: RetentionPolicy,
}

impl RetentionCleanup {
    pub fn new(store: Arc<dyn StatsStore>, policy: RetentionPolicy) -> Self {
        Self { store, policy }
    }

    /// Purge body snapshots older than the policy allows
    pub async fn cleanup_expired_bodies(&self) -> Result<u64> {
        let cutoff = Utc::now() - self.policy.body_snapshot_retention();
        debug!(
            "Purging body snapshots older than {} days (cutoff: {})",
            self.policy.body_snapshot_days, cutoff
        );

        let purged = self.store.purge_body_snapshots(cutoff).await?;
        info!("Retention cleanup completed: {} body snapshots purged", purged);
        Ok(purged)
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.policy.cleanup_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.cleanup_expired_bodies().await {
                        warn!("Periodic retention cleanup failed: {e:#}");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProbeOutcome, StepRecord};
    use crate::probe::executor::tests::{pipeline, step};
    use crate::store::memory::MemoryStatsStore;

    fn outcome(age_days: i64) -> ProbeOutcome {
        let record = StepRecord {
            name: "A".into(),
            url: "https://t/a".into(),
            status: 200,
            headers: Default::default(),
            body: Some("{\"ok\":true}".into()),
            time_ms: 12,
            passed: true,
        };
        let mut outcome = ProbeOutcome::from_steps(
            uuid::Uuid::new_v4(),
            &pipeline(vec![step("A", "https://t/a")]),
            1,
            vec![record],
        );
        outcome.created_at = Utc::now() - chrono::Duration::days(age_days);
        outcome
    }

    #[test]
    fn test_retention_policy_defaults() {
        let policy = RetentionPolicy::default();
        assert_eq!(policy.body_snapshot_days, 7);
        assert_eq!(policy.cleanup_interval, Duration::from_secs(3600));
        assert_eq!(policy.body_snapshot_retention(), chrono::Duration::days(7));
    }

    #[tokio::test]
    async fn test_only_old_bodies_are_purged() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStatsStore::default());
        store.outcomes.lock().unwrap().extend([outcome(10), outcome(1)]);

        let cleanup = RetentionCleanup::new(store.clone(), RetentionPolicy::default());
        assert_eq!(cleanup.cleanup_expired_bodies().await?, 1);

        let outcomes = store.outcomes();
        assert!(outcomes[0].steps.iter().all(|s| s.body.is_none()));
        assert!(outcomes[0].success);
        assert!(outcomes[1].steps[0].body.is_some());
        Ok(())
    }
}

//! Group aggregation window.
//!
//! Tasks enqueued with a group are buffered per (queue, group) and released
//! together when the first bound is hit: no addition for the grace period,
//! the group being older than the max delay, or the group reaching its max
//! size. The window logic is pure; the broker drives it with the clock.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use super::task::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupPolicy {
    pub grace_period: Duration,
    pub max_delay: Duration,
    pub max_size: usize,
}

impl Default for GroupPolicy {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            max_size: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    GracePeriod,
    MaxDelay,
    MaxSize,
}

/// One open group
#[derive(Debug)]
pub struct GroupWindow<T> {
    started_at: Instant,
    last_added_at: Instant,
    items: Vec<T>,
}

impl<T> GroupWindow<T> {
    pub fn new(now: Instant) -> Self {
        Self { started_at: now, last_added_at: now, items: Vec::new() }
    }

    pub fn push(&mut self, item: T, now: Instant) {
        self.items.push(item);
        self.last_added_at = now;
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// First bound reached at `now`, if any
    pub fn due(&self, policy: &GroupPolicy, now: Instant) -> Option<FlushReason> {
        if self.items.len() >= policy.max_size {
            Some(FlushReason::MaxSize)
        } else if now.saturating_duration_since(self.started_at) >= policy.max_delay {
            Some(FlushReason::MaxDelay)
        } else if now.saturating_duration_since(self.last_added_at) >= policy.grace_period {
            Some(FlushReason::GracePeriod)
        } else {
            None
        }
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }
}

/// A released group
#[derive(Debug)]
pub struct Flush<T> {
    pub key: String,
    pub reason: FlushReason,
    pub items: Vec<T>,
}

/// All open groups, keyed by name
#[derive(Debug)]
pub struct AggregationSet<T> {
    policy: GroupPolicy,
    groups: HashMap<String, GroupWindow<T>>,
}

impl<T> AggregationSet<T> {
    pub fn new(policy: GroupPolicy) -> Self {
        Self { policy, groups: HashMap::new() }
    }

    pub fn policy(&self) -> &GroupPolicy {
        &self.policy
    }

    /// Add an item; a group filled to its max size is released right away
    pub fn add(&mut self, key: &str, item: T, now: Instant) -> Option<Flush<T>> {
        let window = self.groups.entry(key.to_string()).or_insert_with(|| GroupWindow::new(now));
        window.push(item, now);

        if window.len() >= self.policy.max_size {
            let window = self.groups.remove(key)?;
            return Some(Flush {
                key: key.to_string(),
                reason: FlushReason::MaxSize,
                items: window.into_items(),
            });
        }
        None
    }

    /// Release every group that reached a bound at `now`
    pub fn take_due(&mut self, now: Instant) -> Vec<Flush<T>> {
        let due: Vec<(String, FlushReason)> = self
            .groups
            .iter()
            .filter_map(|(key, window)| window.due(&self.policy, now).map(|r| (key.clone(), r)))
            .collect();

        due.into_iter()
            .filter_map(|(key, reason)| {
                let window = self.groups.remove(&key)?;
                Some(Flush { key, reason, items: window.into_items() })
            })
            .collect()
    }

    pub fn pending(&self, key: &str) -> usize {
        self.groups.get(key).map_or(0, GroupWindow::len)
    }

    pub fn open_groups(&self) -> usize {
        self.groups.len()
    }
}

/// Combines the tasks of a released group into one task
pub trait GroupAggregator: Send + Sync {
    fn aggregate(&self, group: &str, tasks: Vec<Task>) -> Task;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> GroupPolicy {
        GroupPolicy::default()
    }

    #[test]
    fn test_flushes_after_grace_period_with_every_item() {
        let start = Instant::now();
        let mut set = AggregationSet::new(policy());
        for i in 0..3 {
            assert!(set.add("stats", i, start + Duration::from_millis(500 * i as u64)).is_none());
        }
        let last = start + Duration::from_millis(1000);

        assert!(set.take_due(last + Duration::from_millis(1999)).is_empty());

        let flushed = set.take_due(last + Duration::from_secs(2));
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].reason, FlushReason::GracePeriod);
        assert_eq!(flushed[0].items, vec![0, 1, 2]);

        // Released exactly once.
        assert!(set.take_due(last + Duration::from_secs(30)).is_empty());
        assert_eq!(set.open_groups(), 0);
    }

    #[test]
    fn test_max_delay_wins_over_a_steady_trickle() {
        let start = Instant::now();
        let mut set = AggregationSet::new(policy());
        let mut now = start;
        let mut added = 0;
        let mut flushes = Vec::new();

        // One item per second never lets the grace period elapse.
        while now < start + Duration::from_secs(12) {
            set.add("stats", added, now);
            added += 1;
            now += Duration::from_secs(1);
            flushes.extend(set.take_due(now));
        }

        assert_eq!(flushes.len(), 1);
        assert_eq!(flushes[0].reason, FlushReason::MaxDelay);
        assert_eq!(flushes[0].items, (0..10).collect::<Vec<_>>());
        assert_eq!(set.pending("stats"), added - 10);
    }

    #[test]
    fn test_max_size_releases_immediately() {
        let now = Instant::now();
        let mut set = AggregationSet::new(GroupPolicy { max_size: 10_000, ..policy() });

        for i in 0..9_999 {
            assert!(set.add("stats", i, now).is_none());
        }
        let flush = set.add("stats", 9_999, now).unwrap();
        assert_eq!(flush.reason, FlushReason::MaxSize);
        assert_eq!(flush.items.len(), 10_000);
        assert_eq!(flush.items.first(), Some(&0));
        assert_eq!(flush.items.last(), Some(&9_999));
        assert_eq!(set.pending("stats"), 0);

        set.add("stats", 10_000, now);
        assert_eq!(set.pending("stats"), 1);
    }

    #[test]
    fn test_groups_are_independent() {
        let now = Instant::now();
        let mut set = AggregationSet::new(policy());
        set.add("a", 1, now);
        set.add("b", 2, now + Duration::from_secs(1));

        let flushed = set.take_due(now + Duration::from_secs(2));
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].key, "a");
        assert_eq!(set.pending("b"), 1);
    }
}

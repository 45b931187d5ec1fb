//! Last-session cache.
//!
//! Holds the most recent completed session of every pipeline, bodies
//! stripped, for comparison with the next one. Entries are read and then
//! overwritten without locking: two concurrent invocations of one pipeline
//! race and the last writer wins.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::StoreError;
use crate::models::{PipelineId, Session};

#[async_trait]
pub trait SessionCache: Send + Sync {
    async fn get(&self, pipeline_id: PipelineId) -> Result<Option<Session>, StoreError>;

    async fn put(&self, pipeline_id: PipelineId, session: Session, ttl: Duration)
        -> Result<(), StoreError>;
}

struct Entry {
    expires_at: Instant,
    session: Session,
}

/// Process-local cache with per-entry TTL
#[derive(Default)]
pub struct MemorySessionCache {
    entries: Mutex<HashMap<PipelineId, Entry>>,
}

impl MemorySessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries; returns how many were removed
    pub async fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[async_trait]
impl SessionCache for MemorySessionCache {
    async fn get(&self, pipeline_id: PipelineId) -> Result<Option<Session>, StoreError> {
        let entries = self.entries.lock().await;
        Ok(entries
            .get(&pipeline_id)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.session.clone()))
    }

    async fn put(
        &self,
        pipeline_id: PipelineId,
        session: Session,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let entry = Entry { expires_at: Instant::now() + ttl, session: session.without_bodies() };
        self.entries.lock().await.insert(pipeline_id, entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn session(pipeline_id: PipelineId) -> Session {
        Session::new(Uuid::new_v4(), pipeline_id, vec![])
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() -> anyhow::Result<()> {
        let cache = MemorySessionCache::new();
        let first = session(1);
        cache.put(1, first.clone(), Duration::from_secs(120)).await?;

        tokio::time::advance(Duration::from_secs(119)).await;
        assert_eq!(cache.get(1).await?.map(|s| s.id), Some(first.id));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get(1).await?.is_none());
        assert_eq!(cache.evict_expired().await, 1);
        assert_eq!(cache.len().await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_later_put_replaces_the_entry() -> anyhow::Result<()> {
        let cache = MemorySessionCache::new();
        cache.put(1, session(1), Duration::from_secs(60)).await?;
        let second = session(1);
        cache.put(1, second.clone(), Duration::from_secs(60)).await?;

        assert_eq!(cache.get(1).await?.map(|s| s.id), Some(second.id));
        assert!(cache.get(2).await?.is_none());
        Ok(())
    }
}

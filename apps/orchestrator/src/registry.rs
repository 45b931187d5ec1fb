//! Datacenter registry: where the probing agents live.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::models::{DatacenterId, DatacenterSelection};

/// Geographic location of a datacenter (general, display only)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub city: Option<String>,
    /// ISO 3166-1 alpha-2 country code
    pub country: Option<String>,
    pub region: Option<String>,
}

/// A probing agent reachable over the agent RPC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatacenterTarget {
    pub id: DatacenterId,
    pub base_url: String,
    pub title: String,
    #[serde(default)]
    pub location: GeoLocation,
}

#[async_trait]
pub trait DatacenterRegistry: Send + Sync {
    async fn get_target(&self, id: DatacenterId) -> Result<DatacenterTarget, StoreError>;

    async fn get_all_targets(&self) -> Result<Vec<DatacenterTarget>, StoreError>;
}

/// Fixed set of targets, e.g. from configuration
pub struct StaticRegistry {
    targets: Vec<DatacenterTarget>,
}

impl StaticRegistry {
    pub fn new(targets: Vec<DatacenterTarget>) -> Self {
        Self { targets }
    }
}

#[async_trait]
impl DatacenterRegistry for StaticRegistry {
    async fn get_target(&self, id: DatacenterId) -> Result<DatacenterTarget, StoreError> {
        self.targets
            .iter()
            .find(|target| target.id == id)
            .cloned()
            .ok_or(StoreError::DatacenterNotFound(id))
    }

    async fn get_all_targets(&self) -> Result<Vec<DatacenterTarget>, StoreError> {
        Ok(self.targets.clone())
    }
}

struct CachedTargets {
    fetched_at: Instant,
    targets: Vec<DatacenterTarget>,
}

/// TTL cache in front of another registry
///
/// Writers to the underlying registry call [`CachedRegistry::invalidate`].
pub struct CachedRegistry {
    inner: Arc<dyn DatacenterRegistry>,
    ttl: Duration,
    cache: RwLock<Option<CachedTargets>>,
}

impl CachedRegistry {
    pub fn new(inner: Arc<dyn DatacenterRegistry>, ttl: Duration) -> Self {
        Self { inner, ttl, cache: RwLock::new(None) }
    }

    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }

    async fn targets(&self) -> Result<Vec<DatacenterTarget>, StoreError> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.fetched_at.elapsed() < self.ttl {
                    return Ok(cached.targets.clone());
                }
            }
        }

        debug!("Refreshing datacenter registry cache");
        let targets = self.inner.get_all_targets().await?;
        *self.cache.write().await =
            Some(CachedTargets { fetched_at: Instant::now(), targets: targets.clone() });
        Ok(targets)
    }
}

#[async_trait]
impl DatacenterRegistry for CachedRegistry {
    async fn get_target(&self, id: DatacenterId) -> Result<DatacenterTarget, StoreError> {
        if let Some(target) = self.targets().await?.into_iter().find(|target| target.id == id) {
            return Ok(target);
        }
        // Possibly added since the last refresh.
        self.inner.get_target(id).await
    }

    async fn get_all_targets(&self) -> Result<Vec<DatacenterTarget>, StoreError> {
        self.targets().await
    }
}

/// Turn a pipeline's datacenter selection into concrete targets.
///
/// Explicit ids the registry does not know are skipped with a warning.
pub async fn resolve_targets(
    registry: &dyn DatacenterRegistry,
    selection: &DatacenterSelection,
) -> Result<Vec<DatacenterTarget>, StoreError> {
    match selection {
        DatacenterSelection::All => registry.get_all_targets().await,
        DatacenterSelection::RandomOne => {
            let targets = registry.get_all_targets().await?;
            Ok(targets.choose(&mut rand::thread_rng()).cloned().into_iter().collect())
        }
        DatacenterSelection::Explicit(ids) => {
            let mut seen = HashSet::new();
            let mut targets = Vec::with_capacity(ids.len());
            for id in ids {
                if !seen.insert(*id) {
                    continue;
                }
                match registry.get_target(*id).await {
                    Ok(target) => targets.push(target),
                    Err(StoreError::DatacenterNotFound(id)) => {
                        warn!(datacenter_id = id, "Skipping unknown datacenter")
                    }
                    Err(e) => return Err(e),
                }
            }
            Ok(targets)
        }
    }
}

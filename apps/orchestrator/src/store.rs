//! Storage seams consumed by the core.
//!
//! The libsql implementation lives in [`crate::database`]; tests use the
//! in-memory fakes below.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{PipelineConfig, PipelineId, ProbeOutcome};

/// Which columns of a stored session to load
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionFields {
    /// Load body snapshots (they may have been purged already)
    pub bodies: bool,
}

#[async_trait]
pub trait StatsStore: Send + Sync {
    async fn write_outcome(&self, outcome: &ProbeOutcome) -> Result<(), StoreError>;

    /// All-or-nothing insert of a batch
    async fn write_outcomes_bulk(&self, outcomes: &[ProbeOutcome]) -> Result<(), StoreError>;

    /// Most recent session ids of a pipeline, newest first
    async fn read_last_n_session_ids(
        &self,
        n: usize,
        pipeline_id: PipelineId,
    ) -> Result<Vec<Uuid>, StoreError>;

    async fn read_session(
        &self,
        session_id: Uuid,
        fields: SessionFields,
    ) -> Result<Vec<ProbeOutcome>, StoreError>;

    /// Drop body snapshots of outcomes created before `cutoff`; returns rows touched
    async fn purge_body_snapshots(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait PipelineStore: Send + Sync {
    /// Pipelines with `is_active` set and not past `end_at`
    async fn get_active_pipelines(&self) -> Result<Vec<PipelineConfig>, StoreError>;

    async fn get_pipeline(&self, pipeline_id: PipelineId) -> Result<PipelineConfig, StoreError>;

    /// Switch a pipeline off after a functional (templating) failure
    async fn disable_pipeline_functionality(&self, pipeline_id: PipelineId)
        -> Result<(), StoreError>;

    async fn get_active_heartbeat_pipelines(&self) -> Result<Vec<PipelineConfig>, StoreError> {
        Ok(self
            .get_active_pipelines()
            .await?
            .into_iter()
            .filter(|pipeline| pipeline.scheduling.is_heart_beat)
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod memory {
    //! In-memory stores for tests.

    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    pub(crate) struct MemoryStatsStore {
        pub(crate) outcomes: Mutex<Vec<ProbeOutcome>>,
        pub(crate) bulk_calls: AtomicUsize,
        pub(crate) fail_writes: std::sync::atomic::AtomicBool,
    }

    impl MemoryStatsStore {
        pub(crate) fn outcomes(&self) -> Vec<ProbeOutcome> {
            self.outcomes.lock().unwrap().clone()
        }

        fn check(&self) -> Result<(), StoreError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::Other(anyhow::anyhow!("database is locked")));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl StatsStore for MemoryStatsStore {
        async fn write_outcome(&self, outcome: &ProbeOutcome) -> Result<(), StoreError> {
            self.check()?;
            self.outcomes.lock().unwrap().push(outcome.clone());
            Ok(())
        }

        async fn write_outcomes_bulk(&self, outcomes: &[ProbeOutcome]) -> Result<(), StoreError> {
            self.bulk_calls.fetch_add(1, Ordering::SeqCst);
            self.check()?;
            self.outcomes.lock().unwrap().extend_from_slice(outcomes);
            Ok(())
        }

        async fn read_last_n_session_ids(
            &self,
            n: usize,
            pipeline_id: PipelineId,
        ) -> Result<Vec<Uuid>, StoreError> {
            let outcomes = self.outcomes.lock().unwrap();
            let mut ids: Vec<Uuid> = Vec::new();
            for outcome in outcomes.iter().rev().filter(|o| o.pipeline_id == pipeline_id) {
                if !ids.contains(&outcome.session_id) {
                    ids.push(outcome.session_id);
                }
            }
            ids.truncate(n);
            Ok(ids)
        }

        async fn read_session(
            &self,
            session_id: Uuid,
            fields: SessionFields,
        ) -> Result<Vec<ProbeOutcome>, StoreError> {
            Ok(self
                .outcomes
                .lock()
                .unwrap()
                .iter()
                .filter(|o| o.session_id == session_id)
                .map(|o| if fields.bodies { o.clone() } else { o.without_bodies() })
                .collect())
        }

        async fn purge_body_snapshots(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
            let mut outcomes = self.outcomes.lock().unwrap();
            let mut purged = 0;
            for outcome in outcomes.iter_mut().filter(|o| o.created_at < cutoff) {
                *outcome = outcome.without_bodies();
                purged += 1;
            }
            Ok(purged)
        }
    }

    #[derive(Default)]
    pub(crate) struct MemoryPipelineStore {
        pub(crate) pipelines: Mutex<HashMap<PipelineId, PipelineConfig>>,
        pub(crate) disabled: Mutex<Vec<PipelineId>>,
        pub(crate) reads: AtomicUsize,
    }

    impl MemoryPipelineStore {
        pub(crate) fn with(pipelines: Vec<PipelineConfig>) -> Self {
            let store = Self::default();
            for pipeline in pipelines {
                store.put(pipeline);
            }
            store
        }

        pub(crate) fn put(&self, pipeline: PipelineConfig) {
            self.pipelines.lock().unwrap().insert(pipeline.id(), pipeline);
        }

        pub(crate) fn remove(&self, pipeline_id: PipelineId) {
            self.pipelines.lock().unwrap().remove(&pipeline_id);
        }
    }

    #[async_trait]
    impl PipelineStore for MemoryPipelineStore {
        async fn get_active_pipelines(&self) -> Result<Vec<PipelineConfig>, StoreError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let now = Utc::now();
            let mut active: Vec<PipelineConfig> = self
                .pipelines
                .lock()
                .unwrap()
                .values()
                .filter(|p| p.scheduling.is_runnable(now))
                .cloned()
                .collect();
            active.sort_by_key(PipelineConfig::id);
            Ok(active)
        }

        async fn get_pipeline(&self, pipeline_id: PipelineId) -> Result<PipelineConfig, StoreError> {
            self.pipelines
                .lock()
                .unwrap()
                .get(&pipeline_id)
                .cloned()
                .ok_or(StoreError::PipelineNotFound(pipeline_id))
        }

        async fn disable_pipeline_functionality(
            &self,
            pipeline_id: PipelineId,
        ) -> Result<(), StoreError> {
            self.disabled.lock().unwrap().push(pipeline_id);
            if let Some(pipeline) = self.pipelines.lock().unwrap().get_mut(&pipeline_id) {
                pipeline.scheduling.is_active = false;
            }
            Ok(())
        }
    }
}

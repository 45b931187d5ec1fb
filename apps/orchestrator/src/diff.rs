//! Session state-diff engine.
//!
//! Compares a completed session with the one before it and turns the change
//! in per-datacenter health into at most one transition event.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::models::{
    DatacenterId, DatacenterRef, PipelineConfig, Session, TransitionEvent, TransitionState,
};
use crate::notify::NotificationDispatcher;
use crate::registry::DatacenterRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub state: TransitionState,
    pub resolved: Vec<DatacenterId>,
    pub failed: Vec<DatacenterId>,
}

/// Classify the move from `old` to `new` per-datacenter success.
///
/// A datacenter missing on one side counts as healthy there.
pub fn classify(
    old: &BTreeMap<DatacenterId, bool>,
    new: &BTreeMap<DatacenterId, bool>,
) -> Option<Classification> {
    let keys: BTreeSet<DatacenterId> = old.keys().chain(new.keys()).copied().collect();
    let old_ok = |id: &DatacenterId| old.get(id).copied().unwrap_or(true);
    let new_ok = |id: &DatacenterId| new.get(id).copied().unwrap_or(true);

    let old_success = keys.iter().all(old_ok);
    let new_success = keys.iter().all(new_ok);
    let resolved: Vec<DatacenterId> =
        keys.iter().filter(|id| new_ok(*id) && !old_ok(*id)).copied().collect();
    let failed: Vec<DatacenterId> =
        keys.iter().filter(|id| !new_ok(*id) && old_ok(*id)).copied().collect();

    let state = match (old_success, new_success) {
        (true, false) => TransitionState::Down,
        (false, true) => TransitionState::Up,
        (false, false) if !resolved.is_empty() || !failed.is_empty() => TransitionState::Diff,
        _ => return None,
    };
    Some(Classification { state, resolved, failed })
}

#[derive(Debug, Clone, PartialEq)]
pub enum DiffOutcome {
    /// Nothing to compare against yet
    FirstCycle,
    NoChange,
    Emitted(TransitionEvent),
}

pub struct DiffEngine {
    registry: Arc<dyn DatacenterRegistry>,
    dispatcher: Arc<dyn NotificationDispatcher>,
}

impl DiffEngine {
    pub fn new(registry: Arc<dyn DatacenterRegistry>, dispatcher: Arc<dyn NotificationDispatcher>) -> Self {
        Self { registry, dispatcher }
    }

    /// Compare `new` with `old` and dispatch the resulting event, if any
    pub async fn compare(
        &self,
        pipeline: &PipelineConfig,
        old: Option<&Session>,
        new: &Session,
    ) -> anyhow::Result<DiffOutcome> {
        let Some(old) = old else {
            info!(pipeline_id = pipeline.id(), session_id = %new.id, "First cycle, nothing to compare");
            return Ok(DiffOutcome::FirstCycle);
        };

        let Some(classification) = classify(&old.success_map(), &new.success_map()) else {
            debug!(pipeline_id = pipeline.id(), session_id = %new.id, "No state change");
            return Ok(DiffOutcome::NoChange);
        };

        let event = self.build_event(pipeline, old, new, classification).await;
        info!(
            pipeline_id = pipeline.id(),
            session_id = %new.id,
            state = %event.state,
            "State transition: {}",
            event.summary()
        );
        self.dispatcher.send(&event).await?;
        Ok(DiffOutcome::Emitted(event))
    }

    async fn build_event(
        &self,
        pipeline: &PipelineConfig,
        old: &Session,
        new: &Session,
        classification: Classification,
    ) -> TransitionEvent {
        let (address, root_cause) = match classification.state {
            TransitionState::Down => {
                let last_good = old
                    .outcomes
                    .iter()
                    .find(|outcome| outcome.success)
                    .map(|outcome| outcome.address.clone());
                let root_cause = classification
                    .failed
                    .iter()
                    .find_map(|id| new.outcome_for(*id))
                    .map(|outcome| outcome.status_snapshot.clone());
                (last_good, root_cause)
            }
            TransitionState::Up | TransitionState::Diff => {
                (new.outcomes.first().map(|outcome| outcome.address.clone()), None)
            }
        };

        TransitionEvent {
            kind: pipeline.kind,
            state: classification.state,
            pipeline_id: pipeline.id(),
            pipeline_name: pipeline.name().to_string(),
            project_id: pipeline.scheduling.project_id,
            address: address.unwrap_or_else(|| pipeline.primary_address().to_string()),
            root_cause,
            resolved_datacenters: self.titled(&classification.resolved).await,
            failed_datacenters: self.titled(&classification.failed).await,
            timestamp: Utc::now(),
        }
    }

    async fn titled(&self, ids: &[DatacenterId]) -> Vec<DatacenterRef> {
        let mut refs = Vec::with_capacity(ids.len());
        for id in ids {
            let title = match self.registry.get_target(*id).await {
                Ok(target) => Some(target.title),
                Err(e) => {
                    debug!(datacenter_id = id, "Datacenter title unavailable: {e}");
                    None
                }
            };
            refs.push(DatacenterRef { id: *id, title });
        }
        refs
    }
}

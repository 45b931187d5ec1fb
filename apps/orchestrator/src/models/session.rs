use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{DatacenterId, PipelineId, ProbeOutcome};

/// All legs produced by one pipeline invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub pipeline_id: PipelineId,
    pub outcomes: Vec<ProbeOutcome>,
}

impl Session {
    pub fn new(id: Uuid, pipeline_id: PipelineId, outcomes: Vec<ProbeOutcome>) -> Self {
        Self { id, pipeline_id, outcomes }
    }

    /// Per-datacenter success; a datacenter probed twice must pass twice
    pub fn success_map(&self) -> BTreeMap<DatacenterId, bool> {
        let mut map = BTreeMap::new();
        for outcome in &self.outcomes {
            map.entry(outcome.datacenter_id)
                .and_modify(|ok: &mut bool| *ok &= outcome.success)
                .or_insert(outcome.success);
        }
        map
    }

    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|outcome| outcome.success)
    }

    pub fn outcome_for(&self, datacenter_id: DatacenterId) -> Option<&ProbeOutcome> {
        self.outcomes.iter().find(|outcome| outcome.datacenter_id == datacenter_id)
    }

    /// Same session with every response body removed
    pub fn without_bodies(&self) -> Self {
        Self {
            id: self.id,
            pipeline_id: self.pipeline_id,
            outcomes: self.outcomes.iter().map(ProbeOutcome::without_bodies).collect(),
        }
    }

    pub fn succession(&self) -> Option<SessionSuccession> {
        let started_at = self.outcomes.iter().map(|o| o.created_at).min()?;
        let finished_at = self.outcomes.iter().map(|o| o.created_at).max()?;

        Some(SessionSuccession {
            session_id: self.id,
            pipeline_id: self.pipeline_id,
            started_at,
            finished_at,
            datacenters: self.success_map(),
        })
    }
}

/// Time span and per-datacenter success bits of one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSuccession {
    pub session_id: Uuid,
    pub pipeline_id: PipelineId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub datacenters: BTreeMap<DatacenterId, bool>,
}

impl SessionSuccession {
    pub fn is_success(&self) -> bool {
        self.datacenters.values().all(|ok| *ok)
    }
}

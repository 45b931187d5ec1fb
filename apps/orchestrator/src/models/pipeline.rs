use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{DatacenterId, PipelineId, ProjectId};
use probe_agent::ProbeKind;

/// Sentinel datacenter list meaning "pick one target at random"
pub const RANDOM_DATACENTER_SENTINEL: DatacenterId = 0;

const DEFAULT_STEP_TIMEOUT_MS: u64 = 30_000;

fn default_method() -> String {
    "GET".to_string()
}

/// What a curl step must observe to pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptanceCriteria {
    /// Accepted HTTP status codes; empty means any 2xx
    #[serde(default)]
    pub accepted_status_codes: Vec<u16>,

    /// Top-level keys the JSON body must contain
    #[serde(default)]
    pub required_response_body_keys: Vec<String>,
}

impl AcceptanceCriteria {
    pub fn accepts_status(&self, status: u16) -> bool {
        if self.accepted_status_codes.is_empty() {
            (200..300).contains(&status)
        } else {
            self.accepted_status_codes.contains(&status)
        }
    }
}

/// One step of a pipeline
///
/// `address`, header values and `body` may carry `{{header.<step>.<key>}}` /
/// `{{body.<step>.<path>}}` placeholders resolved from earlier steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,

    /// URL for curl/pagespeed, host for netcat/ping/traceroute
    pub address: String,

    #[serde(default = "default_method")]
    pub method: String,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default)]
    pub body: Option<String>,

    #[serde(default)]
    pub acceptance: AcceptanceCriteria,

    /// netcat only
    #[serde(default)]
    pub port: Option<u16>,

    /// ping only
    #[serde(default)]
    pub count: Option<u32>,

    /// traceroute only
    #[serde(default)]
    pub max_hops: Option<u8>,

    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl Step {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            method: default_method(),
            headers: BTreeMap::new(),
            body: None,
            acceptance: AcceptanceCriteria::default(),
            port: None,
            count: None,
            max_hops: None,
            timeout_ms: None,
        }
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms.unwrap_or(DEFAULT_STEP_TIMEOUT_MS)
    }
}

/// How the datacenters of one invocation are chosen
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatacenterSelection {
    All,
    RandomOne,
    Explicit(Vec<DatacenterId>),
}

impl DatacenterSelection {
    pub fn from_ids(ids: &[DatacenterId]) -> Self {
        match ids {
            [] => DatacenterSelection::All,
            [RANDOM_DATACENTER_SENTINEL] => DatacenterSelection::RandomOne,
            ids => {
                let mut explicit = Vec::with_capacity(ids.len());
                for id in ids {
                    if !explicit.contains(id) {
                        explicit.push(*id);
                    }
                }
                DatacenterSelection::Explicit(explicit)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scheduling {
    pub pipeline_id: PipelineId,
    pub pipeline_name: String,
    pub project_id: ProjectId,
    pub duration_minutes: u32,
    pub is_heart_beat: bool,
    pub is_active: bool,
    /// Empty means all targets, `[0]` one random target
    #[serde(default)]
    pub datacenter_ids: Vec<DatacenterId>,
    #[serde(default)]
    pub end_at: Option<DateTime<Utc>>,
}

impl Scheduling {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.end_at.is_some_and(|end_at| end_at <= now)
    }

    /// Active and not past `end_at`
    pub fn is_runnable(&self, now: DateTime<Utc>) -> bool {
        self.is_active && !self.is_expired(now)
    }

    pub fn selection(&self) -> DatacenterSelection {
        DatacenterSelection::from_ids(&self.datacenter_ids)
    }

    /// Interval between scheduled invocations; heartbeat pipelines run every minute.
    pub fn effective_duration_minutes(&self) -> u32 {
        if self.is_heart_beat { 1 } else { self.duration_minutes.max(1) }
    }

    /// How long the last session stays comparable
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(u64::from(self.duration_minutes.max(1)) * 2 * 60)
    }
}

/// A pipeline as seen by one invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub kind: ProbeKind,
    pub steps: Vec<Step>,
    pub scheduling: Scheduling,
}

impl PipelineConfig {
    pub fn id(&self) -> PipelineId {
        self.scheduling.pipeline_id
    }

    pub fn name(&self) -> &str {
        &self.scheduling.pipeline_name
    }

    /// Address of the first step, used when no better address is known
    pub fn primary_address(&self) -> &str {
        self.steps.first().map(|step| step.address.as_str()).unwrap_or_default()
    }

    /// Copy of this pipeline pinned to already-resolved datacenters
    pub fn with_datacenters(&self, datacenter_ids: Vec<DatacenterId>) -> Self {
        let mut resolved = self.clone();
        resolved.scheduling.datacenter_ids = datacenter_ids;
        resolved
    }
}

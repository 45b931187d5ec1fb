use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{DatacenterId, PipelineId, ProjectId};
use probe_agent::ProbeKind;

/// Aggregate health change between two consecutive sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionState {
    Up,
    Down,
    /// Still failing, but the set of failing datacenters moved
    Diff,
}

impl fmt::Display for TransitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionState::Up => write!(f, "up"),
            TransitionState::Down => write!(f, "down"),
            TransitionState::Diff => write!(f, "diff"),
        }
    }
}

/// Datacenter named in an event; the title is best effort
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatacenterRef {
    pub id: DatacenterId,
    #[serde(default)]
    pub title: Option<String>,
}

impl fmt::Display for DatacenterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.title {
            Some(title) => write!(f, "{title} (#{})", self.id),
            None => write!(f, "#{}", self.id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionEvent {
    #[serde(rename = "type")]
    pub kind: ProbeKind,
    pub state: TransitionState,
    pub pipeline_id: PipelineId,
    pub pipeline_name: String,
    pub project_id: ProjectId,
    pub address: String,
    #[serde(default)]
    pub root_cause: Option<String>,
    #[serde(default)]
    pub resolved_datacenters: Vec<DatacenterRef>,
    #[serde(default)]
    pub failed_datacenters: Vec<DatacenterRef>,
    pub timestamp: DateTime<Utc>,
}

impl TransitionEvent {
    /// One-line summary used by log-based sinks
    pub fn summary(&self) -> String {
        let join = |refs: &[DatacenterRef]| {
            refs.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
        };

        match self.state {
            TransitionState::Up => format!("{} [{}] is back up", self.pipeline_name, self.address),
            TransitionState::Down => format!(
                "{} [{}] is down from {}",
                self.pipeline_name,
                self.address,
                join(&self.failed_datacenters)
            ),
            TransitionState::Diff => format!(
                "{} [{}] still failing; resolved: [{}], failed: [{}]",
                self.pipeline_name,
                self.address,
                join(&self.resolved_datacenters),
                join(&self.failed_datacenters)
            ),
        }
    }
}

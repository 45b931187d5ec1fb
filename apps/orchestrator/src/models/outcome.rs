use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{DatacenterId, PipelineConfig, PipelineId, ProjectId};
use probe_agent::ProbeKind;

/// What one step observed on one datacenter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,

    /// Address after placeholder resolution
    pub url: String,

    /// HTTP status for curl/pagespeed, 0 for the other families and for failures
    pub status: u16,

    #[serde(default)]
    pub headers: BTreeMap<String, Vec<String>>,

    /// Captured body, already size-capped
    #[serde(default)]
    pub body: Option<String>,

    pub time_ms: u64,

    pub passed: bool,
}

impl StepRecord {
    /// Record for a step whose RPC never produced a response
    pub fn synthetic_error(name: &str, url: &str, error: &str) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            status: 0,
            headers: BTreeMap::new(),
            body: Some(serde_json::json!({ "error": error }).to_string()),
            time_ms: 0,
            passed: false,
        }
    }
}

/// Result of one leg: a pipeline run against one datacenter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeOutcome {
    pub session_id: Uuid,
    pub pipeline_id: PipelineId,
    pub project_id: ProjectId,
    pub datacenter_id: DatacenterId,
    pub kind: ProbeKind,

    /// Address of the first executed step
    pub address: String,

    pub success: bool,
    pub average_response_time_ms: f64,
    pub steps: Vec<StepRecord>,

    /// JSON object of step name to body; `None` once stripped or purged
    #[serde(default)]
    pub body_snapshot: Option<String>,
    pub header_snapshot: String,
    pub status_snapshot: String,

    pub created_at: DateTime<Utc>,
}

impl ProbeOutcome {
    /// Aggregate executed steps into an outcome.
    ///
    /// Success requires at least one step and every step passing.
    pub fn from_steps(
        session_id: Uuid,
        pipeline: &PipelineConfig,
        datacenter_id: DatacenterId,
        steps: Vec<StepRecord>,
    ) -> Self {
        let success = !steps.is_empty() && steps.iter().all(|step| step.passed);
        let address = steps
            .first()
            .map(|step| step.url.clone())
            .unwrap_or_else(|| pipeline.primary_address().to_string());

        Self {
            session_id,
            pipeline_id: pipeline.id(),
            project_id: pipeline.scheduling.project_id,
            datacenter_id,
            kind: pipeline.kind,
            address,
            success,
            average_response_time_ms: average_response_time(&steps),
            body_snapshot: Some(body_snapshot(&steps)),
            header_snapshot: header_snapshot(&steps),
            status_snapshot: status_snapshot(&steps),
            steps,
            created_at: Utc::now(),
        }
    }

    /// Zero-success outcome for a leg that never ran a step
    pub fn aborted(session_id: Uuid, pipeline: &PipelineConfig, datacenter_id: DatacenterId) -> Self {
        Self::from_steps(session_id, pipeline, datacenter_id, Vec::new())
    }

    pub fn success_flag(&self) -> u8 {
        u8::from(self.success)
    }

    /// Copy without any response body, as kept in the session cache
    pub fn without_bodies(&self) -> Self {
        let mut stripped = self.clone();
        stripped.body_snapshot = None;
        for step in &mut stripped.steps {
            step.body = None;
        }
        stripped
    }
}

/// Mean of the non-zero step timings; zero when no step has timing.
pub fn average_response_time(steps: &[StepRecord]) -> f64 {
    let timed: Vec<u64> = steps.iter().map(|step| step.time_ms).filter(|t| *t > 0).collect();
    if timed.is_empty() {
        return 0.0;
    }
    timed.iter().sum::<u64>() as f64 / timed.len() as f64
}

fn body_snapshot(steps: &[StepRecord]) -> String {
    let bodies: BTreeMap<&str, &str> = steps
        .iter()
        .map(|step| (step.name.as_str(), step.body.as_deref().unwrap_or_default()))
        .collect();
    serde_json::to_string(&bodies).unwrap_or_default()
}

fn header_snapshot(steps: &[StepRecord]) -> String {
    let headers: BTreeMap<&str, &BTreeMap<String, Vec<String>>> =
        steps.iter().map(|step| (step.name.as_str(), &step.headers)).collect();
    serde_json::to_string(&headers).unwrap_or_default()
}

fn status_snapshot(steps: &[StepRecord]) -> String {
    let statuses: BTreeMap<&str, u16> =
        steps.iter().map(|step| (step.name.as_str(), step.status)).collect();
    serde_json::to_string(&statuses).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str, time_ms: u64, passed: bool) -> StepRecord {
        StepRecord {
            name: name.into(),
            url: format!("https://api.example.com/{name}"),
            status: if passed { 200 } else { 500 },
            headers: BTreeMap::new(),
            body: Some(format!("{{\"step\":\"{name}\"}}")),
            time_ms,
            passed,
        }
    }

    #[test]
    fn test_average_skips_zero_timings() {
        let steps = vec![step("a", 100, true), step("b", 0, false), step("c", 300, true)];
        assert_eq!(average_response_time(&steps), 200.0);
        assert_eq!(average_response_time(&[]), 0.0);
        assert_eq!(average_response_time(&[step("a", 0, false)]), 0.0);
    }

    #[test]
    fn test_synthetic_error_has_zero_timing() {
        let record = StepRecord::synthetic_error("login", "https://x", "connection refused");
        assert_eq!(record.time_ms, 0);
        assert_eq!(record.status, 0);
        assert!(!record.passed);
        assert!(record.body.unwrap().contains("connection refused"));
    }

    #[test]
    fn test_status_snapshot_is_keyed_by_step() {
        let snapshot = status_snapshot(&[step("a", 1, true), step("b", 1, false)]);
        assert_eq!(snapshot, r#"{"a":200,"b":500}"#);
    }
}

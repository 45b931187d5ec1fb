//! Row mapping between domain types and stored columns.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use libsql::Row;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{PipelineConfig, ProbeKind, ProbeOutcome, Scheduling, Step, StepRecord};
use crate::registry::{DatacenterTarget, GeoLocation};

pub const PIPELINE_COLUMNS: &str =
    "id, name, project_id, kind, duration_minutes, is_heart_beat, is_active, datacenter_ids, end_at, steps";

pub const DATACENTER_COLUMNS: &str = "id, base_url, title, city, country, region";

pub const OUTCOME_COLUMNS: &str = "session_id, pipeline_id, project_id, datacenter_id, kind, address, success, \
     average_response_time_ms, steps, body_snapshot, header_snapshot, status_snapshot, created_at";

/// Convert a DateTime to Unix milliseconds
pub fn datetime_to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

/// Convert Unix milliseconds to a DateTime
pub fn millis_to_datetime(millis: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::Other(anyhow::anyhow!("timestamp {millis} out of range")))
}

fn parse_kind(raw: &str) -> Result<ProbeKind, StoreError> {
    raw.parse().map_err(|e: String| StoreError::Other(anyhow::anyhow!(e)))
}

pub fn pipeline_from_row(row: &Row) -> Result<PipelineConfig, StoreError> {
    let kind = parse_kind(&row.get::<String>(3)?)?;
    let datacenter_ids: Vec<i64> = serde_json::from_str(&row.get::<String>(7)?)?;
    let end_at = row.get::<Option<i64>>(8)?.map(millis_to_datetime).transpose()?;
    let steps: Vec<Step> = serde_json::from_str(&row.get::<String>(9)?)?;

    Ok(PipelineConfig {
        kind,
        steps,
        scheduling: Scheduling {
            pipeline_id: row.get(0)?,
            pipeline_name: row.get(1)?,
            project_id: row.get(2)?,
            duration_minutes: row.get::<i64>(4)?.clamp(0, i64::from(u32::MAX)) as u32,
            is_heart_beat: row.get::<i64>(5)? != 0,
            is_active: row.get::<i64>(6)? != 0,
            datacenter_ids,
            end_at,
        },
    })
}

pub fn datacenter_from_row(row: &Row) -> Result<DatacenterTarget, StoreError> {
    Ok(DatacenterTarget {
        id: row.get(0)?,
        base_url: row.get(1)?,
        title: row.get(2)?,
        location: GeoLocation { city: row.get(3)?, country: row.get(4)?, region: row.get(5)? },
    })
}

/// Steps as stored: bodies are kept only in the body snapshot
pub fn steps_without_bodies(steps: &[StepRecord]) -> Result<String, StoreError> {
    let stripped: Vec<StepRecord> =
        steps.iter().map(|step| StepRecord { body: None, ..step.clone() }).collect();
    Ok(serde_json::to_string(&stripped)?)
}

pub fn outcome_from_row(row: &Row, with_bodies: bool) -> Result<ProbeOutcome, StoreError> {
    let session_id = Uuid::parse_str(&row.get::<String>(0)?)
        .map_err(|e| StoreError::Other(anyhow::anyhow!("invalid session id: {e}")))?;
    let mut steps: Vec<StepRecord> = serde_json::from_str(&row.get::<String>(8)?)?;
    let body_snapshot: Option<String> = if with_bodies { row.get(9)? } else { None };

    if let Some(snapshot) = &body_snapshot {
        let bodies: BTreeMap<String, String> = serde_json::from_str(snapshot)?;
        for step in &mut steps {
            step.body = bodies.get(&step.name).filter(|body| !body.is_empty()).cloned();
        }
    }

    Ok(ProbeOutcome {
        session_id,
        pipeline_id: row.get(1)?,
        project_id: row.get(2)?,
        datacenter_id: row.get(3)?,
        kind: parse_kind(&row.get::<String>(4)?)?,
        address: row.get(5)?,
        success: row.get::<i64>(6)? != 0,
        average_response_time_ms: row.get(7)?,
        steps,
        body_snapshot,
        header_snapshot: row.get(10)?,
        status_snapshot: row.get(11)?,
        created_at: millis_to_datetime(row.get(12)?)?,
    })
}

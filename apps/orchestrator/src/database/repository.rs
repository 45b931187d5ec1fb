use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::params;
use uuid::Uuid;

use super::models::{
    DATACENTER_COLUMNS, OUTCOME_COLUMNS, PIPELINE_COLUMNS, datacenter_from_row, datetime_to_millis,
    outcome_from_row, pipeline_from_row, steps_without_bodies,
};
use crate::error::StoreError;
use crate::models::{DatacenterId, PipelineConfig, PipelineId, ProbeOutcome};
use crate::pool::{LibsqlManager, LibsqlPool};
use crate::registry::{DatacenterRegistry, DatacenterTarget};
use crate::store::{PipelineStore, SessionFields, StatsStore};

const INSERT_OUTCOME: &str = "INSERT INTO probe_outcomes (session_id, pipeline_id, project_id, datacenter_id, kind, \
     address, success, average_response_time_ms, steps, body_snapshot, header_snapshot, status_snapshot, created_at) \
     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

/// Stats, pipeline and datacenter storage on one connection pool
pub struct Repository {
    pool: LibsqlPool,
}

impl Repository {
    pub fn new_from_pool(pool: LibsqlPool) -> Self {
        Self { pool }
    }

    /// Get a connection from the pool
    async fn get_conn(&self) -> Result<deadpool::managed::Object<LibsqlManager>, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Other(anyhow::anyhow!("failed to get a database connection: {e}")))
    }

    /// Insert or replace a pipeline definition
    pub async fn upsert_pipeline(&self, pipeline: &PipelineConfig) -> Result<(), StoreError> {
        let conn = self.get_conn().await?;
        let scheduling = &pipeline.scheduling;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO pipelines ({PIPELINE_COLUMNS}, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ),
            params![
                scheduling.pipeline_id,
                scheduling.pipeline_name.clone(),
                scheduling.project_id,
                pipeline.kind.as_str(),
                i64::from(scheduling.duration_minutes),
                i64::from(scheduling.is_heart_beat),
                i64::from(scheduling.is_active),
                serde_json::to_string(&scheduling.datacenter_ids)?,
                scheduling.end_at.map(datetime_to_millis),
                serde_json::to_string(&pipeline.steps)?,
                datetime_to_millis(Utc::now()),
            ],
        )
        .await?;
        Ok(())
    }

    /// Insert or replace a datacenter target
    pub async fn upsert_datacenter(&self, target: &DatacenterTarget) -> Result<(), StoreError> {
        let conn = self.get_conn().await?;
        conn.execute(
            &format!("INSERT OR REPLACE INTO datacenters ({DATACENTER_COLUMNS}, is_active) VALUES (?, ?, ?, ?, ?, ?, 1)"),
            params![
                target.id,
                target.base_url.clone(),
                target.title.clone(),
                target.location.city.clone(),
                target.location.country.clone(),
                target.location.region.clone(),
            ],
        )
        .await?;
        Ok(())
    }
}

fn outcome_params(outcome: &ProbeOutcome) -> Result<Vec<libsql::Value>, StoreError> {
    Ok(vec![
        outcome.session_id.to_string().into(),
        outcome.pipeline_id.into(),
        outcome.project_id.into(),
        outcome.datacenter_id.into(),
        outcome.kind.as_str().into(),
        outcome.address.clone().into(),
        i64::from(outcome.success_flag()).into(),
        outcome.average_response_time_ms.into(),
        steps_without_bodies(&outcome.steps)?.into(),
        outcome.body_snapshot.clone().into(),
        outcome.header_snapshot.clone().into(),
        outcome.status_snapshot.clone().into(),
        datetime_to_millis(outcome.created_at).into(),
    ])
}

#[async_trait]
impl StatsStore for Repository {
    async fn write_outcome(&self, outcome: &ProbeOutcome) -> Result<(), StoreError> {
        let conn = self.get_conn().await?;
        conn.execute(INSERT_OUTCOME, outcome_params(outcome)?).await?;
        Ok(())
    }

    async fn write_outcomes_bulk(&self, outcomes: &[ProbeOutcome]) -> Result<(), StoreError> {
        if outcomes.is_empty() {
            return Ok(());
        }
        let conn = self.get_conn().await?;
        let tx = conn.transaction().await?;
        for outcome in outcomes {
            // Dropping the transaction without commit rolls the batch back.
            tx.execute(INSERT_OUTCOME, outcome_params(outcome)?).await?;
        }
        tx.commit().await?;
        tracing::debug!(count = outcomes.len(), "Inserted outcome batch");
        Ok(())
    }

    async fn read_last_n_session_ids(
        &self,
        n: usize,
        pipeline_id: PipelineId,
    ) -> Result<Vec<Uuid>, StoreError> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT session_id FROM probe_outcomes WHERE pipeline_id = ? \
                 GROUP BY session_id ORDER BY MAX(id) DESC LIMIT ?",
                params![pipeline_id, n as i64],
            )
            .await?;

        let mut ids = Vec::new();
        while let Some(row) = rows.next().await? {
            let raw: String = row.get(0)?;
            ids.push(
                Uuid::parse_str(&raw)
                    .map_err(|e| StoreError::Other(anyhow::anyhow!("invalid session id {raw}: {e}")))?,
            );
        }
        Ok(ids)
    }

    async fn read_session(
        &self,
        session_id: Uuid,
        fields: SessionFields,
    ) -> Result<Vec<ProbeOutcome>, StoreError> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {OUTCOME_COLUMNS} FROM probe_outcomes WHERE session_id = ? ORDER BY datacenter_id, id"),
                params![session_id.to_string()],
            )
            .await?;

        let mut outcomes = Vec::new();
        while let Some(row) = rows.next().await? {
            outcomes.push(outcome_from_row(&row, fields.bodies)?);
        }
        Ok(outcomes)
    }

    async fn purge_body_snapshots(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let conn = self.get_conn().await?;
        let purged = conn
            .execute(
                "UPDATE probe_outcomes SET body_snapshot = NULL WHERE created_at < ? AND body_snapshot IS NOT NULL",
                params![datetime_to_millis(cutoff)],
            )
            .await?;
        Ok(purged)
    }
}

#[async_trait]
impl PipelineStore for Repository {
    async fn get_active_pipelines(&self) -> Result<Vec<PipelineConfig>, StoreError> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {PIPELINE_COLUMNS} FROM pipelines \
                     WHERE is_active = 1 AND (end_at IS NULL OR end_at > ?) ORDER BY id"
                ),
                params![datetime_to_millis(Utc::now())],
            )
            .await?;

        let mut pipelines = Vec::new();
        while let Some(row) = rows.next().await? {
            pipelines.push(pipeline_from_row(&row)?);
        }
        Ok(pipelines)
    }

    async fn get_pipeline(&self, pipeline_id: PipelineId) -> Result<PipelineConfig, StoreError> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(&format!("SELECT {PIPELINE_COLUMNS} FROM pipelines WHERE id = ?"), params![pipeline_id])
            .await?;

        match rows.next().await? {
            Some(row) => pipeline_from_row(&row),
            None => Err(StoreError::PipelineNotFound(pipeline_id)),
        }
    }

    async fn disable_pipeline_functionality(&self, pipeline_id: PipelineId) -> Result<(), StoreError> {
        let conn = self.get_conn().await?;
        let updated = conn
            .execute(
                "UPDATE pipelines SET is_active = 0, updated_at = ? WHERE id = ?",
                params![datetime_to_millis(Utc::now()), pipeline_id],
            )
            .await?;
        if updated == 0 {
            return Err(StoreError::PipelineNotFound(pipeline_id));
        }
        tracing::info!(pipeline_id, "Pipeline disabled");
        Ok(())
    }
}

#[async_trait]
impl DatacenterRegistry for Repository {
    async fn get_target(&self, id: DatacenterId) -> Result<DatacenterTarget, StoreError> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {DATACENTER_COLUMNS} FROM datacenters WHERE id = ? AND is_active = 1"),
                params![id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => datacenter_from_row(&row),
            None => Err(StoreError::DatacenterNotFound(id)),
        }
    }

    async fn get_all_targets(&self) -> Result<Vec<DatacenterTarget>, StoreError> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(&format!("SELECT {DATACENTER_COLUMNS} FROM datacenters WHERE is_active = 1 ORDER BY id"), ())
            .await?;

        let mut targets = Vec::new();
        while let Some(row) = rows.next().await? {
            targets.push(datacenter_from_row(&row)?);
        }
        Ok(targets)
    }
}

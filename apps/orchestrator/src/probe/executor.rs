//! Probe pipeline executor: one leg, one datacenter, steps in order.

use std::sync::Arc;

use probe_agent::AgentClient;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::body::truncate_to_budget;
use super::family::ProbeFamily;
use super::template::{self, PriorResults, StepResponse};
use crate::error::TemplateError;
use crate::models::{PipelineConfig, ProbeOutcome, Step, StepRecord};
use crate::registry::DatacenterTarget;
use crate::store::PipelineStore;

/// Default cap on a captured response body
pub const DEFAULT_BODY_BUDGET_BYTES: usize = 10 * 1024;

/// What one leg produced
#[derive(Debug, Clone)]
pub enum LegResult {
    Completed(ProbeOutcome),
    /// A placeholder could not be resolved; the pipeline has been disabled
    /// and the whole session must be discarded.
    Invalidated { outcome: ProbeOutcome, error: TemplateError },
}

impl LegResult {
    pub fn outcome(&self) -> &ProbeOutcome {
        match self {
            LegResult::Completed(outcome) => outcome,
            LegResult::Invalidated { outcome, .. } => outcome,
        }
    }

    pub fn into_outcome(self) -> ProbeOutcome {
        match self {
            LegResult::Completed(outcome) => outcome,
            LegResult::Invalidated { outcome, .. } => outcome,
        }
    }

    pub fn is_invalidated(&self) -> bool {
        matches!(self, LegResult::Invalidated { .. })
    }
}

/// Executes a pipeline's steps against one datacenter
pub struct PipelineExecutor {
    client: Arc<dyn AgentClient>,
    pipelines: Arc<dyn PipelineStore>,
    body_budget: usize,
}

impl PipelineExecutor {
    pub fn new(
        client: Arc<dyn AgentClient>,
        pipelines: Arc<dyn PipelineStore>,
        body_budget: usize,
    ) -> Self {
        Self { client, pipelines, body_budget }
    }

    /// Run every step of `pipeline` on `target`, stopping at the first failure.
    ///
    /// Steps after the first are rendered against the responses gathered so
    /// far, so step N+1 never starts before step N answered.
    pub async fn execute_leg(
        &self,
        family: &dyn ProbeFamily,
        session_id: Uuid,
        pipeline: &PipelineConfig,
        target: &DatacenterTarget,
    ) -> LegResult {
        let mut prior = PriorResults::new();
        let mut records: Vec<StepRecord> = Vec::with_capacity(pipeline.steps.len());

        for (index, template_step) in pipeline.steps.iter().enumerate() {
            let step = if index == 0 {
                template_step.clone()
            } else {
                match render_step(template_step, &prior) {
                    Ok(step) => step,
                    Err(error) => {
                        warn!(
                            pipeline_id = pipeline.id(),
                            datacenter_id = target.id,
                            step = %template_step.name,
                            "Unresolvable step template, disabling pipeline: {error}"
                        );
                        self.disable(pipeline).await;
                        return LegResult::Invalidated {
                            outcome: ProbeOutcome::aborted(session_id, pipeline, target.id),
                            error,
                        };
                    }
                }
            };

            match family.execute_step(self.client.as_ref(), &target.base_url, &step).await {
                Ok(execution) => {
                    let acceptance = family.evaluate_acceptance(&step, &execution);
                    let passed = acceptance.is_passed();

                    records.push(StepRecord {
                        name: step.name.clone(),
                        url: step.address.clone(),
                        status: execution.status,
                        headers: execution.headers.clone(),
                        body: Some(truncate_to_budget(&execution.body, self.body_budget).to_string()),
                        time_ms: execution.time_ms,
                        passed,
                    });
                    prior.insert(
                        step.name.clone(),
                        StepResponse { headers: execution.headers, body: execution.body },
                    );

                    if !passed {
                        debug!(
                            pipeline_id = pipeline.id(),
                            datacenter_id = target.id,
                            step = %step.name,
                            "Step rejected: {acceptance:?}"
                        );
                        break;
                    }
                }
                Err(e) => {
                    debug!(
                        pipeline_id = pipeline.id(),
                        datacenter_id = target.id,
                        step = %step.name,
                        "Agent call failed: {e}"
                    );
                    // Only the failing step is kept for transport failures.
                    records = vec![StepRecord::synthetic_error(&step.name, &step.address, &e.to_string())];
                    break;
                }
            }
        }

        LegResult::Completed(ProbeOutcome::from_steps(session_id, pipeline, target.id, records))
    }

    async fn disable(&self, pipeline: &PipelineConfig) {
        if let Err(e) = self.pipelines.disable_pipeline_functionality(pipeline.id()).await {
            error!(pipeline_id = pipeline.id(), "Failed to disable pipeline: {e}");
        }
    }
}

/// Resolve the placeholders of a step's address, header values and body
pub fn render_step(step: &Step, prior: &PriorResults) -> Result<Step, TemplateError> {
    let mut rendered = step.clone();
    rendered.address = template::render(&step.address, prior)?;
    for value in rendered.headers.values_mut() {
        *value = template::render(value, prior)?;
    }
    if let Some(body) = &step.body {
        rendered.body = Some(template::render(body, prior)?);
    }
    Ok(rendered)
}

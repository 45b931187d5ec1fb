use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::PipelineId;
use probe_agent::ProbeKind;

/// Caller identity for invocations started on someone's behalf
///
/// Travels inside the task payload and is handed down explicitly; nothing in
/// the core keeps a "current user".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub account_id: i64,
    #[serde(default)]
    pub username: Option<String>,
}

/// Why an invocation happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Scheduled,
    Heartbeat,
    Manual,
}

/// Queue payload of a pipeline invocation task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationPayload {
    pub pipeline_id: PipelineId,
    pub kind: ProbeKind,
    pub trigger: Trigger,
    #[serde(default)]
    pub principal: Option<Principal>,
    /// Absent on periodic payloads, which are built once and enqueued many times
    #[serde(default)]
    pub enqueued_at: Option<DateTime<Utc>>,
}

impl InvocationPayload {
    pub fn new(pipeline_id: PipelineId, kind: ProbeKind, trigger: Trigger) -> Self {
        Self { pipeline_id, kind, trigger, principal: None, enqueued_at: Some(Utc::now()) }
    }

    /// Payload of a periodic schedule entry
    pub fn scheduled(pipeline_id: PipelineId, kind: ProbeKind) -> Self {
        Self { pipeline_id, kind, trigger: Trigger::Scheduled, principal: None, enqueued_at: None }
    }

    pub fn on_behalf_of(mut self, principal: Principal) -> Self {
        self.principal = Some(principal);
        self
    }

    pub fn context(&self) -> InvocationContext {
        InvocationContext { trigger: self.trigger, principal: self.principal.clone() }
    }
}

/// Per-invocation context passed down to the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationContext {
    pub trigger: Trigger,
    pub principal: Option<Principal>,
}

impl InvocationContext {
    pub fn scheduled() -> Self {
        Self { trigger: Trigger::Scheduled, principal: None }
    }

    pub fn principal_label(&self) -> String {
        match &self.principal {
            Some(Principal { username: Some(name), .. }) => name.clone(),
            Some(principal) => format!("account:{}", principal.account_id),
            None => "system".to_string(),
        }
    }
}

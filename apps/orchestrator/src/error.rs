//! Error taxonomy of the orchestration core.
//!
//! The split matters operationally: a [`TemplateError`] disables a pipeline,
//! a [`TaskError::SkipRetry`] is consumed exactly once, and everything that
//! surfaces as [`TaskError::Retry`] goes through the queue's backoff policy.

use thiserror::Error;

use crate::models::{DatacenterId, PipelineId};

/// A step placeholder that cannot be resolved against earlier step results.
///
/// Terminal for the leg; the pipeline is disabled for functionality.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("malformed placeholder {placeholder:?}: {reason}")]
    Malformed { placeholder: String, reason: String },

    #[error("placeholder {placeholder:?} has unknown source {source_name:?}, expected header or body")]
    UnknownSource { placeholder: String, source_name: String },

    #[error("placeholder {placeholder:?} references step {step:?} which has no result")]
    StepNotFound { placeholder: String, step: String },

    #[error("placeholder {placeholder:?} references missing key {path:?} in step {step:?}")]
    KeyNotFound { placeholder: String, step: String, path: String },
}

/// Failure of one of the storage collaborators.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("pipeline {0} not found")]
    PipelineNotFound(PipelineId),

    #[error("datacenter {0} not found")]
    DatacenterNotFound(DatacenterId),

    #[error("database error: {0}")]
    Database(#[from] libsql::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failure reported by the task queue or its inspector.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("task {id} not found in queue {queue}")]
    TaskNotFound { queue: String, id: String },

    #[error("task {id} is active and cannot be deleted")]
    TaskActive { id: String },

    #[error("task id {id} already exists in queue {queue}")]
    DuplicateTask { queue: String, id: String },

    #[error("unknown queue {0}")]
    UnknownQueue(String),

    #[error("failed to encode task payload: {0}")]
    Encode(String),

    #[error("queue broker is shut down")]
    Closed,
}

/// Outcome of a failed task handler.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Retried under the queue's backoff policy, then archived.
    #[error("retryable task failure: {0}")]
    Retry(#[source] anyhow::Error),

    /// Archived right away; the task is never consumed again.
    #[error("terminal task failure: {0}")]
    SkipRetry(String),
}

impl TaskError {
    pub fn retry(error: impl Into<anyhow::Error>) -> Self {
        TaskError::Retry(error.into())
    }

    pub fn skip_retry(reason: impl Into<String>) -> Self {
        TaskError::SkipRetry(reason.into())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskError::SkipRetry(_))
    }
}

impl From<StoreError> for TaskError {
    fn from(error: StoreError) -> Self {
        TaskError::Retry(error.into())
    }
}

impl From<QueueError> for TaskError {
    fn from(error: QueueError) -> Self {
        TaskError::Retry(error.into())
    }
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    ReadFailed { path: String, source: std::io::Error },

    #[error("failed to write config {path}: {source}")]
    WriteFailed { path: String, source: std::io::Error },

    #[error("failed to parse config: {0}")]
    ParseFailed(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),

    #[error("no config path available, set XDG_CONFIG_HOME or HOME")]
    ConfigPathUnavailable,
}

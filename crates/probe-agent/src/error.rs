//! Errors raised while talking to a probing agent.

use thiserror::Error;

/// Failure of a single agent RPC.
///
/// All variants are treated by the orchestrator as a failed step; they are
/// kept distinct so logs and error bodies say what actually went wrong.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid agent base url: {0}")]
    InvalidBaseUrl(#[from] url::ParseError),

    #[error("invalid probe request: {0}")]
    InvalidRequest(String),

    #[error("agent request timed out")]
    Timeout,

    #[error("agent transport error: {0}")]
    Transport(String),

    #[error("agent answered with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode agent response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for AgentError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            AgentError::Timeout
        } else if error.is_decode() {
            AgentError::Decode(error.to_string())
        } else {
            AgentError::Transport(error.to_string())
        }
    }
}

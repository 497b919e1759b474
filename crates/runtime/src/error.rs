use std::time::Duration;

use wayfinder_llm::{LlmError, SupervisorError};
use wayfinder_tools::SessionError;

/// A request-level failure.  None of these touch daemon or supervisor
/// state; the next request starts from scratch.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("inference daemon is not ready")]
    DaemonUnavailable,

    #[error("tool session failed: {0}")]
    Session(#[from] SessionError),

    #[error("model call failed during reasoning: {0}")]
    Reasoning(#[source] LlmError),

    #[error("model call failed while formatting: {0}")]
    Formatter(#[source] LlmError),

    #[error("{stage} exceeded its deadline of {timeout:?}")]
    DeadlineExceeded {
        stage: &'static str,
        timeout: Duration,
    },

    #[error("request cancelled")]
    Cancelled,
}

impl QueryError {
    /// Message safe to show an end user: no protocol payloads, no error
    /// chains.
    pub fn user_message(&self) -> &'static str {
        match self {
            QueryError::DaemonUnavailable => {
                "The language model service is not available right now. Please try again shortly."
            }
            QueryError::Session(_) => {
                "The location search service could not be reached. Please try again."
            }
            QueryError::Reasoning(_) => {
                "The assistant could not complete your request. Please try again."
            }
            QueryError::Formatter(_) => {
                "The search results could not be summarized. Please try again."
            }
            QueryError::DeadlineExceeded { .. } => {
                "The request took too long and was stopped. Try a narrower search."
            }
            QueryError::Cancelled => "The request was cancelled.",
        }
    }
}

/// A process-level failure raised while bringing the service up.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("inference daemon failed to start: {0}")]
    Startup(#[from] SupervisorError),

    #[error("model '{model}' is not installed and could not be provisioned")]
    ProvisioningFailure { model: String },

    #[error("invalid model client configuration: {0}")]
    Client(#[from] LlmError),
}

// ── Tests ────────────────────────────────────────────────────────────────────

//! Local inference daemon plumbing: the Ollama HTTP client, the process
//! supervisor that launches and stops `ollama serve`, and the registry that
//! makes sure the configured model is installed.

mod chat;
mod client;
mod registry;
mod supervisor;

pub use chat::{ChatMessage, ChatModel, ChatResponse, Role, ToolCall};
pub use client::{ModelDescriptor, OllamaClient};
pub use registry::{ModelRegistry, PullOutcome, contains_model};
pub use supervisor::{
    DaemonApi, DaemonHandle, DaemonState, DaemonSupervisor, LaunchCommand, StopReport, StopStep,
    SupervisorError, SupervisorTimings,
};

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("invalid daemon url '{0}': {1}")]
    InvalidUrl(String, #[source] url::ParseError),

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("daemon answered {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("malformed daemon response: {0}")]
    Malformed(String),
}

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod protocol;
mod session;

pub use protocol::McpToolDefinition;
pub use session::{SessionSpec, ToolSession};

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to launch tool process '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tool process transport error: {0}")]
    Transport(String),

    #[error("tool protocol error: {0}")]
    Protocol(String),

    #[error("tool session handshake failed: {0}")]
    Handshake(String),

    #[error("tool request '{method}' timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("tool session is closed")]
    Closed,

    #[error("tool '{0}' was not offered by the tool process")]
    UnknownTool(String),

    #[error("tool '{tool}' reported an error: {message}")]
    ToolFailed { tool: String, message: String },
}

impl SessionError {
    /// `true` when the session itself is unusable; per-call failures such
    /// as a timeout or a tool-reported error leave the pipe intact.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::Spawn { .. }
                | SessionError::Transport(_)
                | SessionError::Handshake(_)
                | SessionError::Closed
        )
    }
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        SessionError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::Protocol(err.to_string())
    }
}

// ── Tool specs ───────────────────────────────────────────────────────────────

/// A negotiated tool, described the way the tool process reported it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object.
    pub parameters: serde_json::Value,
}

impl ToolSpec {
    /// Element of the `tools` array accepted by Ollama's `/api/chat`:
    ///
    /// ```json
    /// {
    ///   "type": "function",
    ///   "function": { "name": "...", "description": "...", "parameters": { "type": "object", ... } }
    /// }
    /// ```
    pub fn to_function_schema(&self) -> serde_json::Value {
        let mut parameters = self.parameters.clone();
        match parameters.as_object_mut() {
            Some(object) => {
                object
                    .entry("type")
                    .or_insert_with(|| serde_json::json!("object"));
                object
                    .entry("properties")
                    .or_insert_with(|| serde_json::json!({}));
            }
            None => parameters = serde_json::json!({"type": "object", "properties": {}}),
        }

        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": parameters,
            }
        })
    }
}

impl From<McpToolDefinition> for ToolSpec {
    fn from(def: McpToolDefinition) -> Self {
        Self {
            name: def.name,
            description: def.description,
            parameters: def.input_schema,
        }
    }
}

/// The `tools` array for a chat request.
pub fn tools_json(specs: &[ToolSpec]) -> serde_json::Value {
    serde_json::Value::Array(specs.iter().map(ToolSpec::to_function_schema).collect())
}

// ── Channel seam ─────────────────────────────────────────────────────────────

/// A negotiated set of tools and a way to invoke them.
#[async_trait]
pub trait ToolChannel: Send + Sync {
    fn tools(&self) -> &[ToolSpec];

    fn has_tool(&self, name: &str) -> bool {
        self.tools().iter().any(|tool| tool.name == name)
    }

    /// Invoke `name` and return its text output.
    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<String, SessionError>;
}

// ── Tests ────────────────────────────────────────────────────────────────────

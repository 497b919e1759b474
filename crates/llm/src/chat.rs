//! Chat message model shared by the reasoning loop and the formatter.
//!
//! Messages are a closed set of variants decided at construction time, so
//! consumers match on structure instead of probing for optional fields.
//! [`ChatMessage::to_ollama`] renders the wire shape accepted by Ollama's
//! `/api/chat` endpoint.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::LlmError;

/// Coarse role of a message, as seen by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Correlation id linking the call to its result.  Generated locally
    /// when the model does not supply one.
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        content: String,
        tool_calls: Vec<ToolCall>,
    },
    /// Data returned by a tool for the call identified by `call_id`.
    ToolResult {
        call_id: String,
        name: String,
        content: String,
    },
    /// A tool call that could not be completed.  Shown to the model so it
    /// can recover, but never treated as returned data.
    ToolError {
        call_id: String,
        name: String,
        error: String,
    },
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Assistant {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self::Assistant {
            content: String::new(),
            tool_calls,
        }
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::ToolResult {
            call_id: call_id.into(),
            name: name.into(),
            content: content.into(),
        }
    }

    pub fn tool_error(
        call_id: impl Into<String>,
        name: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self::ToolError {
            call_id: call_id.into(),
            name: name.into(),
            error: error.into(),
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Self::System { .. } => Role::System,
            Self::User { .. } => Role::User,
            Self::Assistant { .. } => Role::Assistant,
            Self::ToolResult { .. } | Self::ToolError { .. } => Role::Tool,
        }
    }

    /// Tool-call correlation id, for tool-role messages.
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Self::ToolResult { call_id, .. } | Self::ToolError { call_id, .. } => {
                Some(call_id.as_str())
            }
            _ => None,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Self::System { content }
            | Self::User { content }
            | Self::Assistant { content, .. }
            | Self::ToolResult { content, .. } => content,
            Self::ToolError { error, .. } => error,
        }
    }

    /// Render as an element of the `messages` array for `/api/chat`.
    pub fn to_ollama(&self) -> serde_json::Value {
        match self {
            Self::System { content } | Self::User { content } => json!({
                "role": self.role().as_str(),
                "content": content,
            }),
            Self::Assistant {
                content,
                tool_calls,
            } => {
                let mut message = json!({
                    "role": "assistant",
                    "content": content,
                });
                if !tool_calls.is_empty() {
                    message["tool_calls"] = tool_calls
                        .iter()
                        .map(|call| {
                            json!({
                                "id": call.id,
                                "function": {
                                    "name": call.name,
                                    "arguments": call.arguments,
                                }
                            })
                        })
                        .collect();
                }
                message
            }
            Self::ToolResult {
                call_id,
                name,
                content,
            } => json!({
                "role": "tool",
                "tool_call_id": call_id,
                "tool_name": name,
                "content": content,
            }),
            Self::ToolError {
                call_id,
                name,
                error,
            } => json!({
                "role": "tool",
                "tool_call_id": call_id,
                "tool_name": name,
                "content": format!("error: {error}"),
            }),
        }
    }
}

/// One model turn: either final text or a batch of tool calls (or both).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

impl ChatResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            content: String::new(),
            tool_calls,
        }
    }
}

/// A chat-capable model.  `tools` is the function-calling schema array, or
/// `None` for a plain completion.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: Option<&serde_json::Value>,
    ) -> Result<ChatResponse, LlmError>;
}

// ── Tests ────────────────────────────────────────────────────────────────────

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;
use url::Url;

use crate::chat::{ChatMessage, ChatModel, ChatResponse, ToolCall};
use crate::supervisor::DaemonApi;
use crate::LlmError;

/// One entry of the daemon's model listing (`GET /api/tags`).
///
/// Only `name` is interpreted; everything else the daemon reports is kept
/// verbatim in `metadata`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    #[serde(flatten)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ModelDescriptor {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            metadata: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelDescriptor>,
}

#[derive(Debug, Deserialize)]
struct ChatEnvelope {
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: Option<String>,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

/// HTTP client for a local Ollama daemon.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: Url,
    model: String,
    chat_timeout: Duration,
    list_timeout: Duration,
}

impl OllamaClient {
    pub fn new(base_url: &str, model: impl Into<String>) -> Result<Self, LlmError> {
        // A trailing slash makes `Url::join` append instead of replacing the
        // last path segment.
        let normalized = format!("{}/", base_url.trim_end_matches('/'));
        let base_url = Url::parse(&normalized)
            .map_err(|err| LlmError::InvalidUrl(base_url.to_string(), err))?;

        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
            model: model.into(),
            chat_timeout: Duration::from_secs(300),
            list_timeout: Duration::from_secs(10),
        })
    }

    pub fn with_timeouts(mut self, chat_timeout: Duration, list_timeout: Duration) -> Self {
        self.chat_timeout = chat_timeout;
        self.list_timeout = list_timeout;
        self
    }

    fn endpoint(&self, path: &str) -> Result<Url, LlmError> {
        self.base_url
            .join(path)
            .map_err(|err| LlmError::InvalidUrl(path.to_string(), err))
    }

    async fn send_json(
        &self,
        request: reqwest::RequestBuilder,
        url: &Url,
    ) -> Result<serde_json::Value, LlmError> {
        let response = request.send().await.map_err(|source| LlmError::Transport {
            url: url.to_string(),
            source,
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status { status, body });
        }

        response.json().await.map_err(|source| LlmError::Transport {
            url: url.to_string(),
            source,
        })
    }
}

#[async_trait]
impl DaemonApi for OllamaClient {
    async fn probe(&self, timeout: Duration) -> bool {
        let Ok(url) = self.endpoint("api/tags") else {
            return false;
        };
        match self.client.get(url).timeout(timeout).send().await {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                debug!(%err, "daemon health probe failed");
                false
            }
        }
    }

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, LlmError> {
        let url = self.endpoint("api/tags")?;
        let body = self
            .send_json(self.client.get(url.clone()).timeout(self.list_timeout), &url)
            .await?;
        let tags: TagsResponse =
            serde_json::from_value(body).map_err(|err| LlmError::Malformed(err.to_string()))?;
        Ok(tags.models)
    }
}

#[async_trait]
impl ChatModel for OllamaClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: Option<&serde_json::Value>,
    ) -> Result<ChatResponse, LlmError> {
        let url = self.endpoint("api/chat")?;

        let mut payload = json!({
            "model": self.model,
            "messages": messages.iter().map(ChatMessage::to_ollama).collect::<Vec<_>>(),
            "stream": false,
        });
        if let Some(tools) = tools {
            payload["tools"] = tools.clone();
        }

        debug!(model = %self.model, messages = messages.len(), with_tools = tools.is_some(), "ollama chat request");
        let body = self
            .send_json(
                self.client
                    .post(url.clone())
                    .timeout(self.chat_timeout)
                    .json(&payload),
                &url,
            )
            .await?;

        parse_chat_response(body)
    }
}

/// Decode the non-streaming `/api/chat` body.
///
/// Some models emit `arguments` as a JSON-encoded string rather than an
/// object; those are decoded when possible.  Calls without an id receive a
/// generated one so results can always be correlated.
pub(crate) fn parse_chat_response(body: serde_json::Value) -> Result<ChatResponse, LlmError> {
    let envelope: ChatEnvelope =
        serde_json::from_value(body).map_err(|err| LlmError::Malformed(err.to_string()))?;

    let tool_calls = envelope
        .message
        .tool_calls
        .into_iter()
        .map(|call| {
            let arguments = match call.function.arguments {
                serde_json::Value::String(raw) => {
                    serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw))
                }
                serde_json::Value::Null => json!({}),
                other => other,
            };
            let id = call
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
            ToolCall::new(id, call.function.name, arguments)
        })
        .collect();

    Ok(ChatResponse {
        content: envelope.message.content,
        tool_calls,
    })
}

// ── Tests ────────────────────────────────────────────────────────────────────

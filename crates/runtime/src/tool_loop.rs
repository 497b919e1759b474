//! Bounded tool-calling loop.
//!
//! Sends the query with the negotiated tool schema to the model, executes
//! any `tool_calls` it returns over the tool session, feeds the results
//! back as tool-role messages, and repeats until the model answers without
//! calling a tool or the round cap is reached.

use std::sync::Arc;

use tracing::{debug, info, warn};
use wayfinder_llm::{ChatMessage, ChatModel, ToolCall};
use wayfinder_tools::{ToolChannel, tools_json};

use crate::error::QueryError;
use crate::transcript::Transcript;

pub const REASONING_INSTRUCTION: &str = "You are a helpful assistant that can interact with \
     Google Maps. Use the available tools when relevant to handle location-based queries.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStatus {
    /// The model produced an answer without requesting more tools.
    Completed,
    /// Every allowed round requested tools; the transcript ends with the
    /// last round's tool results.
    Exhausted { rounds: usize },
}

#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub transcript: Transcript,
    pub status: LoopStatus,
    /// Rounds in which tools were dispatched.
    pub rounds: usize,
}

pub struct ReasoningLoop {
    model: Arc<dyn ChatModel>,
    max_rounds: usize,
}

impl ReasoningLoop {
    pub fn new(model: Arc<dyn ChatModel>, max_rounds: usize) -> Self {
        Self {
            model,
            max_rounds: max_rounds.max(1),
        }
    }

    pub fn max_rounds(&self) -> usize {
        self.max_rounds
    }

    /// Drive the exchange for `query`.  Tool failures are recorded in the
    /// transcript and shown to the model; only a failed model call or a
    /// broken session aborts the run.
    pub async fn run(
        &self,
        session: &dyn ToolChannel,
        query: &str,
    ) -> Result<LoopOutcome, QueryError> {
        let tools = tools_json(session.tools());
        let tools = (!session.tools().is_empty()).then_some(&tools);

        let mut transcript = Transcript::new();
        transcript.push(ChatMessage::user(query));

        let mut messages = vec![ChatMessage::system(REASONING_INSTRUCTION)];
        messages.push(ChatMessage::user(query));

        for round in 1..=self.max_rounds {
            debug!(round, messages = messages.len(), "reasoning round");

            let response = self
                .model
                .chat(&messages, tools)
                .await
                .map_err(QueryError::Reasoning)?;

            if response.tool_calls.is_empty() {
                let answer = ChatMessage::assistant(response.content);
                messages.push(answer.clone());
                transcript.push(answer);
                return Ok(LoopOutcome {
                    transcript,
                    status: LoopStatus::Completed,
                    rounds: round - 1,
                });
            }

            info!(round, count = response.tool_calls.len(), "model requested tool calls");
            let request = ChatMessage::Assistant {
                content: response.content,
                tool_calls: response.tool_calls.clone(),
            };
            messages.push(request.clone());
            transcript.push(request);

            // One pipe, one request at a time.
            for call in &response.tool_calls {
                let entry = dispatch(session, call).await?;
                messages.push(entry.clone());
                transcript.push(entry);
            }
        }

        warn!(rounds = self.max_rounds, "tool loop hit its round cap");
        Ok(LoopOutcome {
            transcript,
            status: LoopStatus::Exhausted {
                rounds: self.max_rounds,
            },
            rounds: self.max_rounds,
        })
    }
}

/// Run one call and turn the outcome into a transcript entry.  Errors that
/// leave the session unusable are returned instead.
async fn dispatch(session: &dyn ToolChannel, call: &ToolCall) -> Result<ChatMessage, QueryError> {
    if !session.has_tool(&call.name) {
        warn!(tool = %call.name, "model called a tool that was not offered");
        return Ok(ChatMessage::tool_error(
            &call.id,
            &call.name,
            format!("unknown tool '{}'", call.name),
        ));
    }

    debug!(tool = %call.name, id = %call.id, "dispatching tool call");
    match session.call_tool(&call.name, call.arguments.clone()).await {
        Ok(output) => Ok(ChatMessage::tool_result(&call.id, &call.name, output)),
        Err(err) if err.is_fatal() => Err(QueryError::Session(err)),
        Err(err) => {
            warn!(tool = %call.name, %err, "tool call failed");
            Ok(ChatMessage::tool_error(&call.id, &call.name, err.to_string()))
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

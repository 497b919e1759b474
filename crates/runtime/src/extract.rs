//! Picks the tool-returned data out of a transcript.

use wayfinder_llm::ChatMessage;

use crate::transcript::Transcript;

/// Tool data found in a transcript.  `Absent` is an ordinary outcome (a
/// search that found nothing, or a model that never called a tool).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractedPayload {
    Payload(String),
    Absent,
}

impl ExtractedPayload {
    pub fn as_deref(&self) -> Option<&str> {
        match self {
            ExtractedPayload::Payload(content) => Some(content),
            ExtractedPayload::Absent => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, ExtractedPayload::Absent)
    }
}

/// Content of the first tool result with a non-empty correlation id.
/// Tool errors never qualify.
pub fn extract(transcript: &Transcript) -> ExtractedPayload {
    transcript
        .iter()
        .find_map(|message| match message {
            ChatMessage::ToolResult {
                call_id, content, ..
            } if !call_id.is_empty() => Some(ExtractedPayload::Payload(content.clone())),
            _ => None,
        })
        .unwrap_or(ExtractedPayload::Absent)
}

// ── Tests ────────────────────────────────────────────────────────────────────

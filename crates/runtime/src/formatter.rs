//! Final rendering step: one plain (tool-free) model call that turns the
//! extracted payload into the user-facing answer.
//!
//! The output rules are carried by the prompt, so compliance is checked
//! after the fact with [`FormattingContract::check`] and only logged.

use std::sync::Arc;

use tracing::{debug, warn};
use wayfinder_llm::{ChatMessage, ChatModel, LlmError};

use crate::extract::ExtractedPayload;
use crate::places::{self, PlaceDigest, Tier};

pub const CLOSING_LINE: &str =
    "Would you like directions or more details about any of these places?";

/// Embedded in place of a missing payload.
pub const NO_RESULTS_PAYLOAD: &str =
    "NO RESULTS: the location search returned no places for this query.";

pub const DEFAULT_WORD_LIMIT: usize = 200;

/// What the formatter embeds in its prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum PromptPayload {
    Places(PlaceDigest),
    Raw(String),
    NoResults,
}

impl PromptPayload {
    /// Absent payloads and empty searches both become `NoResults`.
    pub fn from_extracted(payload: &ExtractedPayload) -> Self {
        let Some(content) = payload.as_deref().filter(|c| !c.trim().is_empty()) else {
            return PromptPayload::NoResults;
        };

        match places::parse_places(content) {
            Some(found) if found.is_empty() => PromptPayload::NoResults,
            Some(found) => PromptPayload::Places(PlaceDigest::from_places(found)),
            None => PromptPayload::Raw(
                places::truncate_chars(content.trim(), places::RAW_PAYLOAD_MAX_CHARS).to_string(),
            ),
        }
    }

    pub fn is_no_results(&self) -> bool {
        matches!(self, PromptPayload::NoResults)
    }

    fn render(&self) -> String {
        match self {
            PromptPayload::Places(digest) => digest.render(),
            PromptPayload::Raw(text) => text.clone(),
            PromptPayload::NoResults => NO_RESULTS_PAYLOAD.to_string(),
        }
    }
}

/// Output rules for the final answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormattingContract {
    pub word_limit: usize,
}

impl Default for FormattingContract {
    fn default() -> Self {
        Self {
            word_limit: DEFAULT_WORD_LIMIT,
        }
    }
}

/// Result of checking a text against the contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractReport {
    pub word_count: usize,
    pub word_limit: usize,
    pub has_closing_line: bool,
    pub tiers_present: Vec<Tier>,
    pub forbidden: Vec<&'static str>,
}

impl ContractReport {
    pub fn within_word_limit(&self) -> bool {
        self.word_count <= self.word_limit
    }

    pub fn is_compliant(&self) -> bool {
        self.within_word_limit() && self.has_closing_line && self.forbidden.is_empty()
    }
}

impl FormattingContract {
    pub fn new(word_limit: usize) -> Self {
        Self { word_limit }
    }

    pub fn system_instruction(&self) -> String {
        format!(
            "You are a friendly local guide presenting location search results.\n\
             Rules:\n\
             - Never use code blocks, JSON, or any raw data from the search results.\n\
             - Never mention place IDs, coordinates, or internal field names.\n\
             - Keep the whole answer under {limit} words.\n\
             - Use plain text with **bold** place names and short bullet points.\n\
             - Always end with exactly this line: \"{CLOSING_LINE}\"",
            limit = self.word_limit,
        )
    }

    pub fn user_prompt(&self, query: &str, payload: &PromptPayload) -> String {
        if payload.is_no_results() {
            return format!(
                "The user asked: \"{query}\"\n\n\
                 Search results:\n{NO_RESULTS_PAYLOAD}\n\n\
                 Tell the user in one or two sentences that no matching places were found \
                 and suggest how to refine the search (a different area, a broader category). \
                 Do not invent places. End with: \"{CLOSING_LINE}\""
            );
        }

        format!(
            "The user asked: \"{query}\"\n\n\
             Search results:\n{results}\n\n\
             Write the answer using this template:\n\n\
             Here are some great options for <what the user asked for>:\n\n\
             **{top}**\n\
             - **<Name>** (<short location>) - <rating>. <one or two notable features>\n\n\
             **{high}**\n\
             - **<Name>** (<short location>) - <rating>. <one or two notable features>\n\n\
             **{other}**\n\
             - **<Name>** (<short location>) - <one or two notable features>\n\n\
             <One sentence recommending the best pick and why.>\n\n\
             {CLOSING_LINE}\n\n\
             Group places by rating: {top_min:.1} and above under \"{top_heading}\", \
             {high_min:.1} up to {top_min:.1} under \"{high_heading}\", everything else under \
             \"{other_heading}\". Leave out groups that have no places.",
            results = payload.render(),
            top = Tier::TopRated.label(),
            high = Tier::HighlyRated.label(),
            other = Tier::AlsoWorthALook.label(),
            top_min = places::TOP_RATED_MIN,
            high_min = places::HIGHLY_RATED_MIN,
            top_heading = Tier::TopRated.heading(),
            high_heading = Tier::HighlyRated.heading(),
            other_heading = Tier::AlsoWorthALook.heading(),
        )
    }

    pub fn check(&self, text: &str) -> ContractReport {
        let mut forbidden = Vec::new();
        if text.contains("```") {
            forbidden.push("code fence");
        }
        if text.contains('{') || text.contains('}') {
            forbidden.push("raw JSON");
        }
        if text.contains("place_id") {
            forbidden.push("place_id");
        }

        ContractReport {
            word_count: text.split_whitespace().count(),
            word_limit: self.word_limit,
            has_closing_line: text.trim_end().ends_with(CLOSING_LINE),
            tiers_present: Tier::ALL
                .into_iter()
                .filter(|tier| text.contains(tier.heading()))
                .collect(),
            forbidden,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FormattedResponse {
    pub text: String,
    pub no_results: bool,
    pub report: ContractReport,
}

pub struct ResponseFormatter {
    model: Arc<dyn ChatModel>,
    contract: FormattingContract,
}

impl ResponseFormatter {
    pub fn new(model: Arc<dyn ChatModel>, contract: FormattingContract) -> Self {
        Self { model, contract }
    }

    /// Render `payload` for `query`.  The model's text is returned verbatim;
    /// contract violations are logged, not corrected.
    pub async fn format(
        &self,
        query: &str,
        payload: &ExtractedPayload,
    ) -> Result<FormattedResponse, LlmError> {
        let prompt_payload = PromptPayload::from_extracted(payload);
        if prompt_payload.is_no_results() {
            debug!(absent = payload.is_absent(), "formatting a no-results answer");
        }

        let messages = [
            ChatMessage::system(self.contract.system_instruction()),
            ChatMessage::user(self.contract.user_prompt(query, &prompt_payload)),
        ];
        let response = self.model.chat(&messages, None).await?;
        let text = response.content;

        let report = self.contract.check(&text);
        if !report.is_compliant() {
            warn!(
                words = report.word_count,
                limit = report.word_limit,
                closing_line = report.has_closing_line,
                forbidden = ?report.forbidden,
                "formatted answer breaks the output contract"
            );
        }

        Ok(FormattedResponse {
            text,
            no_results: prompt_payload.is_no_results(),
            report,
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

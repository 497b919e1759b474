mod error;
pub mod extract;
pub mod formatter;
mod pipeline;
pub mod places;
mod service;
mod tool_loop;
mod transcript;

pub use error::{QueryError, ServiceError};
pub use extract::{ExtractedPayload, extract};
pub use formatter::{
    CLOSING_LINE, ContractReport, FormattedResponse, FormattingContract, NO_RESULTS_PAYLOAD,
    PromptPayload, ResponseFormatter,
};
pub use pipeline::{QueryPipeline, QueryResponse, ResponseStatus};
pub use places::{Place, PlaceDigest, Tier};
pub use service::LocationService;
pub use tool_loop::{LoopOutcome, LoopStatus, REASONING_INSTRUCTION, ReasoningLoop};
pub use transcript::Transcript;

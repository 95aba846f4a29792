//! Hosted generative-model client.
//!
//! `LlmClient` is the seam the chat orchestrator depends on; `GeminiClient`
//! talks to the hosted `generateContent` API. Tests substitute scripted
//! mocks at the trait.

pub mod client;
pub mod gemini;
pub mod types;

pub use client::LlmClient;
pub use gemini::GeminiClient;
pub use types::{ChatTurn, Completion, GenerationRequest, Role, ToolCall, ToolDecl, ToolExchange};

use thiserror::Error;

/// Errors from the generative-model API.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM request failed: {0}")]
    Http(String),
    #[error("LLM request timed out after {0}s")]
    Timeout(u64),
    #[error("LLM responded with status {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("LLM response could not be parsed: {0}")]
    ResponseParsing(String),
    #[error("LLM returned no candidates")]
    EmptyResponse,
}

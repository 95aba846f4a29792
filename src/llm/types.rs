//! Conversation and completion types shared across the crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who produced a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// One turn of a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatTurn {
    pub fn now(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// A model-initiated request to invoke a named tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: serde_json::Value,
}

/// A tool declaration advertised to the model.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDecl {
    pub name: &'static str,
    pub description: &'static str,
    /// JSON-schema object describing the parameters.
    pub parameters: serde_json::Value,
}

/// A completed tool round fed back into the next model invocation.
#[derive(Debug, Clone)]
pub struct ToolExchange {
    pub call: ToolCall,
    pub response: serde_json::Value,
}

/// The model's answer: text plus any tool calls it requested.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
}

/// Everything one model invocation needs.
///
/// The prompt already carries the patient context and recent history;
/// `tool_results` holds prior rounds of this turn so a re-invocation sees
/// what its tools returned.
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub system: String,
    pub prompt: String,
    pub tools: Vec<ToolDecl>,
    pub tool_results: Vec<ToolExchange>,
}

//! Chat orchestration: patient context assembly, tool execution, and the
//! per-patient conversation loop against the hosted model.

pub mod context;
pub mod session;
pub mod tools;

pub use context::ContextBuilder;
pub use session::{ChatSession, SessionManager, SessionOptions};
pub use tools::{ToolExecutor, ToolName};

use thiserror::Error;

use crate::llm::LlmError;
use crate::storage::StorageError;

/// Failures inside the chat/tool orchestration layer.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("no records for patient {0}")]
    PatientNotFound(String),

    #[error("invalid tool argument: {0}")]
    InvalidArgument(String),

    #[error("model requested unknown tool: {0}")]
    UnknownTool(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("model error: {0}")]
    Llm(#[from] LlmError),
}

impl AgentError {
    /// Whether this failure can be recovered inside a turn by feeding a
    /// structured note back to the model instead of failing the turn.
    pub fn is_recoverable_in_turn(&self) -> bool {
        matches!(
            self,
            AgentError::PatientNotFound(_)
                | AgentError::InvalidArgument(_)
                | AgentError::UnknownTool(_)
        )
    }
}

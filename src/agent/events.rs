use crate::providers::base::{Message, ToolCallRequest};
use serde::Serialize;

/// Structured events the engine emits over its channel. One ReAct turn
/// produces a lazy sequence of these; consumers (coordinator logging, the
/// TAP bridge) never see the raw provider stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Incremental assistant text.
    Token { delta: String },
    /// A complete message appended to the session history.
    Message { message: Message },
    /// The assistant requested tool calls (fully assembled).
    ToolCall { tool_calls: Vec<ToolCallRequest> },
    /// One tool finished; results are emitted in original call order.
    ToolResult {
        tool_call_id: String,
        name: String,
        result: String,
    },
    /// Terminal failure for this turn.
    Error {
        code: String,
        message: String,
        recoverable: bool,
    },
    /// The turn ended: "finish" (finish tool), "end_turn" (plain answer),
    /// "max_iterations", or "error".
    Finish { reason: String },
}

impl AgentEvent {
    pub fn error(code: impl Into<String>, message: impl Into<String>, recoverable: bool) -> Self {
        AgentEvent::Error {
            code: code.into(),
            message: message.into(),
            recoverable,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AgentEvent::Token { .. } => "token",
            AgentEvent::Message { .. } => "message",
            AgentEvent::ToolCall { .. } => "tool_call",
            AgentEvent::ToolResult { .. } => "tool_result",
            AgentEvent::Error { .. } => "error",
            AgentEvent::Finish { .. } => "finish",
        }
    }
}

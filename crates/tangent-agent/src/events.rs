//! Events emitted by a streaming agent run.

use serde::Serialize;

use tangent::Usage;
use tangent::chat::ChatMessage;

use crate::confirmation::ConfirmationRequest;
use crate::tools::ToolCallResult;

/// One event in the multiplexed stream of an agent run.
///
/// Ordering within a turn: all `Text`/`Reasoning` chunks precede any
/// `ToolCall`; each `ToolCall` precedes its `ToolCallResult` or
/// `ConfirmationRequest`; `Usage` closes the turn. `Conversation` is emitted
/// exactly once, as the final event of a successful run.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Text delta from the model.
    Text { content: String },
    /// Reasoning trace fragment; only emitted when `log_reasoning` is on.
    Reasoning { content: String },
    /// The model requested a tool invocation.
    ToolCall { call: tangent::ToolCall },
    /// A tool finished, was denied, or recorded a pending confirmation.
    ToolCallResult { result: ToolCallResult },
    /// A gated tool is waiting for the caller's approval.
    ConfirmationRequest { request: ConfirmationRequest },
    /// Re-emission of a nested agent's event.
    Downstream {
        agent_id: String,
        event: Box<AgentEvent>,
    },
    /// Cumulative usage after a turn.
    Usage { usage: Usage },
    /// The final transcript.
    Conversation { messages: Vec<ChatMessage> },
}

impl AgentEvent {
    /// The text payload, for `Text` events.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            AgentEvent::Text { content } => Some(content),
            _ => None,
        }
    }
}

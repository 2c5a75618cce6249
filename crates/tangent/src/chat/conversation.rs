//! Append-only conversation transcript.

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::ToolCall;
use crate::chat::ChatMessage;

/// An ordered, append-only sequence of chat messages.
///
/// The buffer tracks which assistant tool calls are still unresolved so that
/// a tool result appended without a matching call can be detected. Such an
/// append is a logic error on the caller's side but must not fail: the
/// message is stored and the violation is recorded for inspection.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Vec<ChatMessage>,
    unresolved_calls: HashMap<String, usize>,
    violations: Vec<InvariantViolation>,
}

/// A recorded transcript-invariant violation.
#[derive(Debug, Clone, PartialEq)]
pub struct InvariantViolation {
    /// Id of the offending tool result.
    pub tool_call_id: String,
    pub detail: String,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a buffer from existing messages, seeding the unresolved-call
    /// bookkeeping from any assistant tool calls they contain.
    pub fn from_messages(messages: Vec<ChatMessage>) -> Self {
        let mut conversation = Self::new();
        for message in messages {
            conversation.push(message);
        }
        conversation
    }

    pub fn push_system(&mut self, content: impl Into<String>) {
        self.push(ChatMessage::system(content));
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.push(ChatMessage::user(content));
    }

    pub fn push_assistant(&mut self, content: impl Into<String>, tool_calls: Vec<ToolCall>) {
        self.push(ChatMessage::assistant_with_tools(content, tool_calls));
    }

    pub fn push_tool_result(
        &mut self,
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        arguments: Map<String, Value>,
        result: Value,
    ) {
        self.push(ChatMessage::ToolResult {
            tool_call_id: tool_call_id.into(),
            name: name.into(),
            arguments,
            content: result,
        });
    }

    /// Append an already-built message, maintaining the call bookkeeping.
    pub fn push(&mut self, message: ChatMessage) {
        let index = self.messages.len();
        match &message {
            ChatMessage::Assistant { tool_calls, .. } => {
                for call in tool_calls {
                    self.unresolved_calls.insert(call.id.clone(), index);
                }
            }
            ChatMessage::ToolResult { tool_call_id, .. } => {
                if self.unresolved_calls.remove(tool_call_id).is_none() {
                    self.violations.push(InvariantViolation {
                        tool_call_id: tool_call_id.clone(),
                        detail: "tool result without a prior unresolved tool call".to_string(),
                    });
                }
            }
            _ => {}
        }
        self.messages.push(message);
    }

    /// Replace the system message, or insert one at the front if none exists.
    pub fn set_system(&mut self, content: impl Into<String>) {
        let content = content.into();
        for message in &mut self.messages {
            if let ChatMessage::System { content: existing } = message {
                *existing = content;
                return;
            }
        }
        self.messages.insert(0, ChatMessage::System { content });
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<ChatMessage> {
        self.messages
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Tool-call ids that no tool result has answered yet.
    pub fn unresolved_call_ids(&self) -> Vec<&str> {
        self.unresolved_calls.keys().map(String::as_str).collect()
    }

    /// Invariant violations recorded so far (for tests and diagnostics).
    pub fn invariant_violations(&self) -> &[InvariantViolation] {
        &self.violations
    }
}

impl Serialize for Conversation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.messages.serialize(serializer)
    }
}

impl<'a> IntoIterator for &'a Conversation {
    type Item = &'a ChatMessage;
    type IntoIter = std::slice::Iter<'a, ChatMessage>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.iter()
    }
}

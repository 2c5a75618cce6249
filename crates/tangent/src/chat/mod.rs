use async_trait::async_trait;
use futures::{Stream, StreamExt};
use schemars::JsonSchema;
use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;

use crate::error::BackendError;
use crate::pricing::ModelPricing;
use crate::{ToolCall, Usage};

pub mod conversation;

pub use conversation::{Conversation, InvariantViolation};

/// Role of a participant in a chat conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    /// Instructions that frame the whole conversation
    System,
    /// The human participant
    User,
    /// The model
    Assistant,
    /// A tool answering an assistant tool call
    Tool,
}

/// A single message in a chat conversation.
///
/// Assistant messages may carry the tool calls the model requested; tool
/// messages answer exactly one of those calls by id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum ChatMessage {
    System {
        content: String,
    },
    User {
        content: String,
        /// Image URLs attached to the message. Backends without vision
        /// support fail with [`BackendError::ImagesUnsupported`].
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        images: Vec<String>,
    },
    Assistant {
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    #[serde(rename = "tool")]
    ToolResult {
        /// Id of the assistant tool call this message answers.
        tool_call_id: String,
        /// Name of the invoked tool.
        name: String,
        /// Arguments the tool was invoked with (after hook mutation).
        arguments: Map<String, Value>,
        /// The value the tool returned.
        content: Value,
    },
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage::System {
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage::User {
            content: content.into(),
            images: Vec::new(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        ChatMessage::Assistant {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        ChatMessage::Assistant {
            content: content.into(),
            tool_calls,
        }
    }

    pub fn role(&self) -> ChatRole {
        match self {
            ChatMessage::System { .. } => ChatRole::System,
            ChatMessage::User { .. } => ChatRole::User,
            ChatMessage::Assistant { .. } => ChatRole::Assistant,
            ChatMessage::ToolResult { .. } => ChatRole::Tool,
        }
    }

    /// The textual content of the message; tool results render their value.
    pub fn content_text(&self) -> String {
        match self {
            ChatMessage::System { content }
            | ChatMessage::User { content, .. }
            | ChatMessage::Assistant { content, .. } => content.clone(),
            ChatMessage::ToolResult { content, .. } => match content {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
        }
    }
}

/// Per-call tunables understood by backends.
///
/// All fields are optional; `None` means "backend default". Options overlay
/// by pointwise rightward override via [`BackendOptions::merge`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendOptions {
    /// Upper bound on completion tokens for a single response.
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    /// Stop sequences.
    pub stop: Option<Vec<String>>,
    /// Force the response to be valid JSON.
    pub json_mode: Option<bool>,
    /// JSON schema the response must conform to.
    pub output_schema: Option<Value>,
}

impl BackendOptions {
    /// Overlay `other` on top of `self`: fields set on `other` win.
    pub fn merge(&self, other: &BackendOptions) -> BackendOptions {
        BackendOptions {
            max_tokens: other.max_tokens.or(self.max_tokens),
            temperature: other.temperature.or(self.temperature),
            top_p: other.top_p.or(self.top_p),
            stop: other.stop.clone().or_else(|| self.stop.clone()),
            json_mode: other.json_mode.or(self.json_mode),
            output_schema: other
                .output_schema
                .clone()
                .or_else(|| self.output_schema.clone()),
        }
    }
}

/// Schema of a tool as passed to the backend: name, description and a
/// JSON-Schema-like parameters object.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Tool choice determines how the model uses available tools.
/// The behavior is standardized across backends.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ToolChoice {
    /// Model can use any tool, and may elect to use none.
    #[default]
    Auto,
    /// Explicitly disables the use of tools.
    None,
    /// Model must use at least one tool (it decides which).
    Required,
    /// Model must use the named tool and only that tool.
    Tool(String),
}

impl Serialize for ToolChoice {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            ToolChoice::Auto => serializer.serialize_str("auto"),
            ToolChoice::None => serializer.serialize_str("none"),
            ToolChoice::Required => serializer.serialize_str("required"),
            ToolChoice::Tool(name) => {
                use serde::ser::SerializeMap;

                // {"type": "function", "function": {"name": ...}}
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("type", "function")?;
                let mut function_obj = HashMap::new();
                function_obj.insert("name", name.as_str());
                map.serialize_entry("function", &function_obj)?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for ToolChoice {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ToolChoiceVisitor;

        impl<'de> Visitor<'de> for ToolChoiceVisitor {
            type Value = ToolChoice;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str(
                    "a string (`auto`, `none`, `required`) or an object `{ type: \"function\", function: { name: ... } }`",
                )
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                match value {
                    "auto" => Ok(ToolChoice::Auto),
                    "none" => Ok(ToolChoice::None),
                    "required" => Ok(ToolChoice::Required),
                    other => Err(de::Error::unknown_variant(
                        other,
                        &["auto", "none", "required"],
                    )),
                }
            }

            fn visit_map<M>(self, mut map: M) -> Result<Self::Value, M::Error>
            where
                M: MapAccess<'de>,
            {
                let mut seen_name: Option<String> = None;

                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "type" => {
                            let t: String = map.next_value()?;
                            if t != "function" {
                                return Err(de::Error::invalid_value(
                                    de::Unexpected::Str(&t),
                                    &"function",
                                ));
                            }
                        }
                        "function" => {
                            let func_map: Map<String, Value> = map.next_value()?;
                            if let Some(Value::String(name)) = func_map.get("name") {
                                seen_name = Some(name.clone());
                            } else {
                                return Err(de::Error::missing_field("name"));
                            }
                        }
                        _ => {
                            let _ignored: Value = map.next_value()?;
                        }
                    }
                }

                let name = seen_name.ok_or_else(|| de::Error::missing_field("function"))?;
                Ok(ToolChoice::Tool(name))
            }
        }

        deserializer.deserialize_any(ToolChoiceVisitor)
    }
}

/// One chunk of a streaming response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ChunkEvent {
    /// Text content delta
    Text(String),
    /// Reasoning/thinking delta
    Reasoning(String),
    /// A tool call block started (id and name are known, arguments follow)
    ToolCallStart { id: String, name: String },
    /// Partial JSON for a tool call's arguments
    ToolCallDelta { id: String, partial_json: String },
    /// Complete tool call with parsed arguments
    ToolCall(ToolCall),
    /// Token accounting; the final non-error chunk of a response
    Usage(Usage),
}

/// Buffers fragmented tool-call deltas and emits one complete [`ToolCall`]
/// per id once the accumulated arguments parse as a JSON object.
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    pending: HashMap<String, PendingCall>,
}

#[derive(Debug)]
struct PendingCall {
    name: String,
    buffer: String,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the start of a tool call block.
    pub fn start(&mut self, id: impl Into<String>, name: impl Into<String>) {
        self.pending.insert(
            id.into(),
            PendingCall {
                name: name.into(),
                buffer: String::new(),
            },
        );
    }

    /// Append an argument fragment. Returns the assembled call once the
    /// buffered fragments form a complete JSON object.
    pub fn push_delta(&mut self, id: &str, fragment: &str) -> Option<ToolCall> {
        let pending = self.pending.get_mut(id)?;
        pending.buffer.push_str(fragment);
        let arguments: Map<String, Value> = serde_json::from_str(&pending.buffer).ok()?;
        let pending = self.pending.remove(id)?;
        Some(ToolCall::function(id, pending.name, arguments))
    }

    /// Flush a call whose argument stream ended; an empty buffer counts as `{}`.
    pub fn finish(&mut self, id: &str) -> Option<ToolCall> {
        let pending = self.pending.remove(id)?;
        let arguments: Map<String, Value> = if pending.buffer.is_empty() {
            Map::new()
        } else {
            serde_json::from_str(&pending.buffer).ok()?
        };
        Some(ToolCall::function(id, pending.name, arguments))
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// A structured, non-streaming backend response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendResponse {
    /// The text completion.
    pub content: String,
    /// Tool calls the model requested, if any.
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    /// Reasoning trace, when the backend exposes one.
    #[serde(default)]
    pub reasoning: Option<String>,
    /// Token accounting for this response.
    #[serde(default)]
    pub usage: Usage,
    /// Provider-specific metadata bag.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// A lazily produced sequence of response chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ChunkEvent, BackendError>> + Send>>;

/// Uniform interface over heterogeneous chat backends.
///
/// Implementations must uphold the streaming contract: within one response,
/// text chunks preserve generation order, complete tool calls follow any text
/// they succeed in the underlying stream, and the `Usage` chunk appears
/// exactly once as the final non-error chunk.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Single-shot generation.
    ///
    /// The default implementation drains [`ChatBackend::generate_stream`]
    /// and assembles the chunks into a [`BackendResponse`].
    async fn generate(
        &self,
        conversation: &Conversation,
        options: &BackendOptions,
        tools: Option<&[ToolSchema]>,
        tool_choice: Option<&ToolChoice>,
    ) -> Result<BackendResponse, BackendError> {
        let mut stream = self
            .generate_stream(conversation, options, tools, tool_choice)
            .await?;

        let mut response = BackendResponse::default();
        let mut reasoning = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk? {
                ChunkEvent::Text(text) => response.content.push_str(&text),
                ChunkEvent::Reasoning(text) => reasoning.push_str(&text),
                ChunkEvent::ToolCall(call) => response.tool_calls.push(call),
                ChunkEvent::ToolCallStart { .. } | ChunkEvent::ToolCallDelta { .. } => {}
                ChunkEvent::Usage(usage) => response.usage = usage,
            }
        }
        if !reasoning.is_empty() {
            response.reasoning = Some(reasoning);
        }
        if response.content.is_empty() && response.tool_calls.is_empty() {
            return Err(BackendError::EmptyResponse);
        }
        Ok(response)
    }

    /// Streaming generation.
    async fn generate_stream(
        &self,
        conversation: &Conversation,
        options: &BackendOptions,
        tools: Option<&[ToolSchema]>,
        tool_choice: Option<&ToolChoice>,
    ) -> Result<ChunkStream, BackendError>;

    /// Approximate token count of a conversation.
    ///
    /// The default sums message content lengths; the only contract is that
    /// the value is monotonic in conversation growth.
    fn count_tokens(&self, conversation: &Conversation) -> u64 {
        conversation
            .messages()
            .iter()
            .map(|m| m.content_text().len() as u64)
            .sum()
    }

    /// Options applied when the caller supplies none.
    fn default_options(&self) -> BackendOptions {
        BackendOptions::default()
    }

    /// Unit prices for the configured model, when known.
    fn pricing(&self) -> Option<ModelPricing> {
        None
    }
}

//! OpenAI-wire HTTP backend client.
//!
//! Speaks the `chat/completions` dialect most hosted gateways expose, in both
//! single-shot and SSE streaming form. Provider quirks beyond that dialect
//! are out of scope; the [`ChatBackend`] trait is the seam for anything else.

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::collections::HashMap;

use crate::chat::{
    BackendOptions, BackendResponse, ChatBackend, ChatMessage, ChunkEvent, ChunkStream,
    Conversation, ToolChoice, ToolSchema,
};
use crate::error::BackendError;
use crate::pricing::ModelPricing;
use crate::{FunctionCall, ToolCall, Usage};

/// A chat backend reached over HTTP with the OpenAI wire format.
pub struct HttpBackend {
    model: String,
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
    default_options: BackendOptions,
    pricing: Option<ModelPricing>,
}

impl HttpBackend {
    pub fn new(model: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            base_url: base_url.into(),
            api_key: None,
            client: reqwest::Client::new(),
            default_options: BackendOptions::default(),
            pricing: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_default_options(mut self, options: BackendOptions) -> Self {
        self.default_options = options;
        self
    }

    pub fn with_pricing(mut self, pricing: ModelPricing) -> Self {
        self.pricing = Some(pricing);
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn request(&self, body: &Value) -> reqwest::RequestBuilder {
        let mut request = self.client.post(self.endpoint()).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        request
    }

    fn build_body(
        &self,
        conversation: &Conversation,
        options: &BackendOptions,
        tools: Option<&[ToolSchema]>,
        tool_choice: Option<&ToolChoice>,
        stream: bool,
    ) -> Result<Value, BackendError> {
        let mut object = Map::new();
        object.insert("model".to_string(), json!(self.model));
        object.insert(
            "messages".to_string(),
            Value::Array(wire_messages(&self.model, conversation)?),
        );

        if let Some(max_tokens) = options.max_tokens {
            object.insert("max_tokens".to_string(), json!(max_tokens));
        }
        if let Some(temperature) = options.temperature {
            object.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(top_p) = options.top_p {
            object.insert("top_p".to_string(), json!(top_p));
        }
        if let Some(stop) = &options.stop {
            object.insert("stop".to_string(), json!(stop));
        }
        if let Some(schema) = &options.output_schema {
            object.insert(
                "response_format".to_string(),
                json!({"type": "json_schema", "json_schema": schema}),
            );
        } else if options.json_mode == Some(true) {
            object.insert("response_format".to_string(), json!({"type": "json_object"}));
        }
        if let Some(tools) = tools
            && !tools.is_empty()
        {
            let wire_tools: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            object.insert("tools".to_string(), json!(wire_tools));
            if let Some(choice) = tool_choice {
                object.insert("tool_choice".to_string(), serde_json::to_value(choice)?);
            }
        }
        if stream {
            object.insert("stream".to_string(), json!(true));
            object.insert("stream_options".to_string(), json!({"include_usage": true}));
        }
        Ok(Value::Object(object))
    }

    fn cost_of(&self, usage: &Usage) -> f64 {
        self.pricing.map(|p| p.cost_of(usage)).unwrap_or(0.0)
    }
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn generate(
        &self,
        conversation: &Conversation,
        options: &BackendOptions,
        tools: Option<&[ToolSchema]>,
        tool_choice: Option<&ToolChoice>,
    ) -> Result<BackendResponse, BackendError> {
        let body = self.build_body(conversation, options, tools, tool_choice, false)?;
        let response = self.request(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status {
                code: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let payload: Value = response.json().await?;
        let mut parsed = parse_completion(&payload)?;
        parsed.usage.estimated_cost = self.cost_of(&parsed.usage);
        Ok(parsed)
    }

    async fn generate_stream(
        &self,
        conversation: &Conversation,
        options: &BackendOptions,
        tools: Option<&[ToolSchema]>,
        tool_choice: Option<&ToolChoice>,
    ) -> Result<ChunkStream, BackendError> {
        let body = self.build_body(conversation, options, tools, tool_choice, true)?;
        let response = self.request(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status {
                code: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let pricing = self.pricing;
        let (tx, rx) = futures::channel::mpsc::channel::<Result<ChunkEvent, BackendError>>(32);
        tokio::spawn(async move {
            let mut tx = tx;
            let mut bytes = response.bytes_stream();
            let mut parser = SseParser::default();
            let mut pending_usage: Option<Usage> = None;

            while let Some(part) = bytes.next().await {
                let part = match part {
                    Ok(part) => part,
                    Err(e) => {
                        let _ = tx.try_send(Err(BackendError::Connection(e.to_string())));
                        return;
                    }
                };
                match parser.push(&part) {
                    Ok(events) => {
                        for event in events {
                            // Hold the usage back so it is the final chunk.
                            if let ChunkEvent::Usage(mut usage) = event {
                                usage.estimated_cost =
                                    pricing.map(|p| p.cost_of(&usage)).unwrap_or(0.0);
                                pending_usage = Some(usage);
                                continue;
                            }
                            if futures::SinkExt::send(&mut tx, Ok(event)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.try_send(Err(e));
                        return;
                    }
                }
                if parser.done {
                    break;
                }
            }
            if let Some(usage) = pending_usage {
                let _ = futures::SinkExt::send(&mut tx, Ok(ChunkEvent::Usage(usage))).await;
            }
        });

        Ok(Box::pin(rx))
    }

    fn default_options(&self) -> BackendOptions {
        self.default_options.clone()
    }

    fn pricing(&self) -> Option<ModelPricing> {
        self.pricing
    }
}

/// Convert the transcript into OpenAI wire messages.
fn wire_messages(model: &str, conversation: &Conversation) -> Result<Vec<Value>, BackendError> {
    let mut messages = Vec::with_capacity(conversation.len());
    for message in conversation {
        let value = match message {
            ChatMessage::System { content } => json!({"role": "system", "content": content}),
            ChatMessage::User { content, images } => {
                if !images.is_empty() {
                    return Err(BackendError::ImagesUnsupported(model.to_string()));
                }
                json!({"role": "user", "content": content})
            }
            ChatMessage::Assistant {
                content,
                tool_calls,
            } => {
                let mut value = json!({"role": "assistant", "content": content});
                if !tool_calls.is_empty() {
                    let calls: Result<Vec<Value>, BackendError> = tool_calls
                        .iter()
                        .map(|call| {
                            Ok(json!({
                                "id": call.id,
                                "type": call.call_type,
                                "function": {
                                    "name": call.function.name,
                                    // The wire format carries arguments as a JSON string.
                                    "arguments": serde_json::to_string(&call.function.arguments)?,
                                }
                            }))
                        })
                        .collect();
                    value["tool_calls"] = Value::Array(calls?);
                }
                value
            }
            ChatMessage::ToolResult {
                tool_call_id,
                content,
                ..
            } => {
                let rendered = match content {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                json!({"role": "tool", "tool_call_id": tool_call_id, "content": rendered})
            }
        };
        messages.push(value);
    }
    Ok(messages)
}

#[derive(Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    call_type: String,
    function: WireFunction,
}

#[derive(Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

fn function_type() -> String {
    "function".to_string()
}

/// Parse a non-streaming `chat/completions` payload.
fn parse_completion(payload: &Value) -> Result<BackendResponse, BackendError> {
    let message = payload
        .pointer("/choices/0/message")
        .ok_or_else(|| BackendError::ResponseValidation("missing choices[0].message".into()))?;

    let content = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let reasoning = message
        .get("reasoning_content")
        .or_else(|| message.get("reasoning"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let mut tool_calls = Vec::new();
    if let Some(raw_calls) = message.get("tool_calls").and_then(Value::as_array) {
        for raw in raw_calls {
            let wire: WireToolCall = serde_json::from_value(raw.clone())
                .map_err(|e| BackendError::ResponseValidation(format!("bad tool call: {e}")))?;
            let arguments: Map<String, Value> = if wire.function.arguments.is_empty() {
                Map::new()
            } else {
                serde_json::from_str(&wire.function.arguments).map_err(|e| {
                    BackendError::ResponseValidation(format!(
                        "tool call `{}` has unparsable arguments: {e}",
                        wire.function.name
                    ))
                })?
            };
            tool_calls.push(ToolCall {
                id: wire.id,
                call_type: wire.call_type,
                function: FunctionCall {
                    name: wire.function.name,
                    arguments,
                },
            });
        }
    }

    if content.is_empty() && tool_calls.is_empty() {
        return Err(BackendError::EmptyResponse);
    }

    let mut usage: Usage = payload
        .get("usage")
        .map(|u| serde_json::from_value(u.clone()))
        .transpose()
        .map_err(|e| BackendError::ResponseValidation(format!("bad usage: {e}")))?
        .unwrap_or_default();
    usage.requests = 1;

    let mut metadata = Map::new();
    if let Some(model) = payload.get("model") {
        metadata.insert("model".to_string(), model.clone());
    }
    if let Some(finish) = payload.pointer("/choices/0/finish_reason") {
        metadata.insert("finish_reason".to_string(), finish.clone());
    }

    Ok(BackendResponse {
        content,
        tool_calls,
        reasoning,
        usage,
        metadata,
    })
}

/// State for parsing the SSE byte stream into chunk events.
#[derive(Default)]
struct SseParser {
    line_buffer: String,
    tool_states: HashMap<usize, ToolCallState>,
    done: bool,
}

#[derive(Default)]
struct ToolCallState {
    id: String,
    name: String,
    arguments_buffer: String,
    started: bool,
}

#[derive(Deserialize)]
struct StreamPayload {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
    reasoning_content: Option<String>,
    tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(Deserialize)]
struct StreamToolCall {
    index: Option<usize>,
    id: Option<String>,
    function: StreamFunction,
}

#[derive(Deserialize)]
struct StreamFunction {
    name: Option<String>,
    #[serde(default)]
    arguments: String,
}

impl SseParser {
    /// Feed raw bytes; returns the chunk events completed by them.
    fn push(&mut self, bytes: &[u8]) -> Result<Vec<ChunkEvent>, BackendError> {
        self.line_buffer.push_str(&String::from_utf8_lossy(bytes));
        let mut events = Vec::new();

        while let Some(newline) = self.line_buffer.find('\n') {
            let line: String = self.line_buffer.drain(..=newline).collect();
            self.parse_line(line.trim(), &mut events)?;
            if self.done {
                break;
            }
        }
        Ok(events)
    }

    fn parse_line(&mut self, line: &str, events: &mut Vec<ChunkEvent>) -> Result<(), BackendError> {
        let Some(data) = line.strip_prefix("data: ") else {
            return Ok(());
        };

        if data == "[DONE]" {
            // Flush calls whose argument stream ended without parsing early.
            for (_, state) in self.tool_states.drain() {
                if let Some(call) = complete_call(&state) {
                    events.push(ChunkEvent::ToolCall(call));
                }
            }
            self.done = true;
            return Ok(());
        }

        let payload: StreamPayload =
            serde_json::from_str(data).map_err(|e| BackendError::ResponseValidation(format!(
                "failed to parse stream chunk: {e}"
            )))?;

        if let Some(mut usage) = payload.usage {
            usage.requests = 1;
            events.push(ChunkEvent::Usage(usage));
        }

        for choice in &payload.choices {
            if let Some(content) = &choice.delta.content
                && !content.is_empty()
            {
                events.push(ChunkEvent::Text(content.clone()));
            }
            if let Some(reasoning) = &choice.delta.reasoning_content
                && !reasoning.is_empty()
            {
                events.push(ChunkEvent::Reasoning(reasoning.clone()));
            }
            let Some(tool_calls) = &choice.delta.tool_calls else {
                continue;
            };
            for tc in tool_calls {
                let index = tc.index.unwrap_or(0);
                let state = self.tool_states.entry(index).or_default();

                if let Some(id) = &tc.id {
                    state.id = id.clone();
                }
                if let Some(name) = &tc.function.name {
                    state.name = name.clone();
                    if !state.started {
                        state.started = true;
                        events.push(ChunkEvent::ToolCallStart {
                            id: state.id.clone(),
                            name: state.name.clone(),
                        });
                    }
                }
                if !tc.function.arguments.is_empty() {
                    state.arguments_buffer.push_str(&tc.function.arguments);
                    events.push(ChunkEvent::ToolCallDelta {
                        id: state.id.clone(),
                        partial_json: tc.function.arguments.clone(),
                    });
                    // Emit the complete call as soon as the buffer parses.
                    if let Ok(arguments) =
                        serde_json::from_str::<Map<String, Value>>(&state.arguments_buffer)
                    {
                        let call = ToolCall::function(&state.id, &state.name, arguments);
                        self.tool_states.remove(&index);
                        events.push(ChunkEvent::ToolCall(call));
                    }
                }
            }
        }
        Ok(())
    }
}

fn complete_call(state: &ToolCallState) -> Option<ToolCall> {
    if !state.started {
        return None;
    }
    let arguments: Map<String, Value> = if state.arguments_buffer.is_empty() {
        Map::new()
    } else {
        serde_json::from_str(&state.arguments_buffer).ok()?
    };
    Some(ToolCall::function(&state.id, &state.name, arguments))
}

//! Scripted backend for unit tests.

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::VecDeque;

use tangent::chat::{
    BackendOptions, ChatBackend, ChunkEvent, ChunkStream, Conversation, ToolChoice, ToolSchema,
};
use tangent::error::BackendError;
use tangent::{ToolCall, Usage};

/// One scripted backend response, emitted as a chunk stream.
#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    pub text: Vec<String>,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
}

impl ScriptedResponse {
    pub fn text(content: &str, usage: Usage) -> Self {
        Self {
            text: vec![content.to_string()],
            reasoning: None,
            tool_calls: Vec::new(),
            usage,
        }
    }

    pub fn tool_calls(calls: Vec<ToolCall>, usage: Usage) -> Self {
        Self {
            text: Vec::new(),
            reasoning: None,
            tool_calls: calls,
            usage,
        }
    }

    pub fn with_reasoning(mut self, reasoning: &str) -> Self {
        self.reasoning = Some(reasoning.to_string());
        self
    }

    pub fn with_text_chunks(mut self, chunks: &[&str]) -> Self {
        self.text = chunks.iter().map(|c| c.to_string()).collect();
        self
    }
}

/// What the backend saw on one call; recorded for assertions.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub message_count: usize,
    pub tool_names: Vec<String>,
    pub tool_choice: Option<ToolChoice>,
    pub max_tokens: Option<u32>,
}

/// A backend that plays back a script of responses and records what it was
/// asked.
#[derive(Default)]
pub struct MockBackend {
    script: Mutex<VecDeque<ScriptedResponse>>,
    recorded: Mutex<Vec<RecordedCall>>,
    fixed_token_count: Option<u64>,
}

impl MockBackend {
    pub fn new(responses: Vec<ScriptedResponse>) -> Self {
        Self {
            script: Mutex::new(responses.into()),
            recorded: Mutex::new(Vec::new()),
            fixed_token_count: None,
        }
    }

    /// Make `count_tokens` return a fixed value, for budget tests.
    pub fn with_token_count(mut self, count: u64) -> Self {
        self.fixed_token_count = Some(count);
        self
    }

    pub fn recorded(&self) -> Vec<RecordedCall> {
        self.recorded.lock().clone()
    }

    pub fn calls_made(&self) -> usize {
        self.recorded.lock().len()
    }
}

#[async_trait]
impl ChatBackend for MockBackend {
    async fn generate_stream(
        &self,
        conversation: &Conversation,
        options: &BackendOptions,
        tools: Option<&[ToolSchema]>,
        tool_choice: Option<&ToolChoice>,
    ) -> Result<ChunkStream, BackendError> {
        self.recorded.lock().push(RecordedCall {
            message_count: conversation.len(),
            tool_names: tools
                .map(|tools| tools.iter().map(|t| t.name.clone()).collect())
                .unwrap_or_default(),
            tool_choice: tool_choice.cloned(),
            max_tokens: options.max_tokens,
        });

        let Some(response) = self.script.lock().pop_front() else {
            return Err(BackendError::Connection("mock script exhausted".to_string()));
        };

        let mut chunks: Vec<Result<ChunkEvent, BackendError>> = Vec::new();
        if let Some(reasoning) = response.reasoning {
            chunks.push(Ok(ChunkEvent::Reasoning(reasoning)));
        }
        for text in response.text {
            chunks.push(Ok(ChunkEvent::Text(text)));
        }
        for call in response.tool_calls {
            chunks.push(Ok(ChunkEvent::ToolCall(call)));
        }
        chunks.push(Ok(ChunkEvent::Usage(response.usage)));

        Ok(Box::pin(stream::iter(chunks)))
    }

    fn count_tokens(&self, conversation: &Conversation) -> u64 {
        match self.fixed_token_count {
            Some(count) => count,
            None => conversation
                .messages()
                .iter()
                .map(|m| m.content_text().len() as u64)
                .sum(),
        }
    }
}

/// Build an arguments map from (key, value) pairs.
pub fn args(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

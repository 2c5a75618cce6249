//! The streaming run: a single producer task multiplexing text chunks, tool
//! events, confirmation requests and usage updates onto one bounded channel.

use futures::{Stream, StreamExt};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use tangent::Usage;
use tangent::chat::{ChatMessage, ChunkEvent, ToolChoice, ToolSchema};
use tangent::error::BackendError;

use crate::agent::{
    Agent, AgentInput, AgentResult, RunParams, check_token_limits, clamped_backend_options,
};
use crate::error::AgentError;
use crate::events::AgentEvent;
use crate::options::TurnLimit;
use crate::post_processor::PostProcessor;
use crate::tools::ToolCallResult;
use crate::tools::invoke::{ToolEvent, spawn_dispatch};
use crate::tools::registry::build_registry;

/// Capacity of the event channel; bounds the producer's lead over a slow
/// consumer.
const EVENT_CHANNEL_CAPACITY: usize = 64;

type EventSender = mpsc::Sender<Result<AgentEvent, AgentError>>;

/// Why the producer stopped early.
enum StreamAbort {
    /// The consumer dropped the stream.
    Cancelled,
    Failed(AgentError),
}

impl From<AgentError> for StreamAbort {
    fn from(error: AgentError) -> Self {
        StreamAbort::Failed(error)
    }
}

impl From<BackendError> for StreamAbort {
    fn from(error: BackendError) -> Self {
        StreamAbort::Failed(AgentError::Backend(error))
    }
}

impl Agent {
    /// Run the agent and return the event stream.
    pub fn run_streaming(&self, input: impl Into<AgentInput>) -> AgentRunStream {
        self.spawn_streaming(input.into(), RunParams::new())
    }

    /// Streaming run with explicit options, context, tool choice and
    /// post-processors.
    ///
    /// Non-streaming post-processors are rejected here unless
    /// [`RunParams::allow_non_streaming`] was set.
    pub fn run_streaming_with(
        &self,
        input: impl Into<AgentInput>,
        params: RunParams,
    ) -> Result<AgentRunStream, AgentError> {
        if !params.allow_non_streaming
            && params.post_processors.iter().any(|p| !p.supports_streaming())
        {
            return Err(AgentError::InvalidPostProcessor(
                "non-streaming post-processors are not allowed unless allow_non_streaming is set"
                    .to_string(),
            ));
        }
        Ok(self.spawn_streaming(input.into(), params))
    }

    fn spawn_streaming(&self, input: AgentInput, params: RunParams) -> AgentRunStream {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let agent = self.clone();
        let post_processors = params.post_processors.clone();
        tokio::spawn(stream_producer(agent.clone(), input, params, tx));
        AgentRunStream::new(rx, agent, post_processors)
    }
}

async fn stream_producer(agent: Agent, input: AgentInput, params: RunParams, tx: EventSender) {
    match stream_run(&agent, input, &params, &tx).await {
        Ok(()) => {}
        Err(StreamAbort::Cancelled) => {
            tracing::debug!(agent = %agent.id(), "stream consumer dropped; cancelling run");
            if agent.inner.owns_sessions {
                for session in &agent.inner.mcp_sessions {
                    session.cleanup().await;
                }
            }
        }
        Err(StreamAbort::Failed(error)) => {
            // An error terminates the stream immediately; no usage or
            // conversation trailers follow.
            let _ = tx.send(Err(error)).await;
        }
    }
}

async fn emit(tx: &EventSender, event: AgentEvent) -> Result<(), StreamAbort> {
    tx.send(Ok(event))
        .await
        .map_err(|_| StreamAbort::Cancelled)
}

async fn stream_run(
    agent: &Agent,
    input: AgentInput,
    params: &RunParams,
    tx: &EventSender,
) -> Result<(), StreamAbort> {
    let inner = &agent.inner;
    let context = params.context.clone().unwrap_or_default();
    context.register_agent(agent);

    let merged = match &params.options {
        Some(options) => inner.default_options.merge(options),
        None => inner.default_options.clone(),
    };
    let resolved = merged.resolve();
    let base_options = resolved
        .backend_options
        .clone()
        .unwrap_or_else(|| inner.backend.default_options());

    let mut conversation = agent.render_conversation(&input)?;
    let registry = build_registry(&inner.tools, &inner.mcp_sessions).await?;
    let schemas = registry.schemas();

    // Confirmation ids surfaced during this run; asking twice would loop.
    let mut requested_confirmations: HashSet<String> = HashSet::new();
    let mut text_only_finisher = false;
    let mut turn_count = 0usize;

    loop {
        // The finisher turn is the +1 on top of the turn budget.
        if !text_only_finisher
            && let TurnLimit::Limit(limit) = resolved.max_turns
            && turn_count >= limit
        {
            return Err(AgentError::MaxTurnsExceeded(limit).into());
        }
        check_token_limits(
            &resolved,
            &context.usage(),
            &conversation,
            inner.backend.as_ref(),
        )?;
        let call_options = clamped_backend_options(&base_options, &resolved, &context.usage());

        let (turn_tools, turn_choice): (Option<&[ToolSchema]>, Option<&ToolChoice>) =
            if text_only_finisher {
                (None, None)
            } else if turn_count == 0 {
                (Some(schemas.as_slice()), params.tool_choice.as_ref())
            } else {
                (Some(schemas.as_slice()), None)
            };

        tracing::debug!(
            agent = %inner.id,
            turn = turn_count,
            finisher = text_only_finisher,
            "requesting streaming completion"
        );
        let mut chunks = inner
            .backend
            .generate_stream(&conversation, &call_options, turn_tools, turn_choice)
            .await?;

        let mut turn_text = String::new();
        let mut turn_calls = Vec::new();
        let mut turn_usage: Option<Usage> = None;

        while let Some(chunk) = chunks.next().await {
            match chunk? {
                ChunkEvent::Text(text) => {
                    turn_text.push_str(&text);
                    emit(tx, AgentEvent::Text { content: text }).await?;
                }
                ChunkEvent::Reasoning(text) => {
                    if resolved.log_reasoning {
                        emit(tx, AgentEvent::Reasoning { content: text }).await?;
                    }
                }
                ChunkEvent::ToolCall(call) => {
                    turn_calls.push(call.clone());
                    emit(tx, AgentEvent::ToolCall { call }).await?;
                }
                // Backends emit assembled calls per the streaming contract;
                // raw fragments carry no loop-level event.
                ChunkEvent::ToolCallStart { .. } | ChunkEvent::ToolCallDelta { .. } => {}
                ChunkEvent::Usage(usage) => turn_usage = Some(usage),
            }
        }

        if turn_calls.is_empty() || text_only_finisher {
            // Terminal turn: plain text, or the post-confirmation finisher.
            // The finisher is never allowed to dispatch tools.
            conversation.push_assistant(turn_text, Vec::new());
            if let Some(usage) = turn_usage {
                context.add_usage(usage);
            }
            emit(tx, AgentEvent::Usage { usage: context.usage() }).await?;
            break;
        }

        conversation.push_assistant(turn_text.clone(), turn_calls.clone());

        let mut has_pending_confirmation = false;
        let mut turn_confirmation_ids: HashSet<String> = HashSet::new();
        let mut tool_events = spawn_dispatch(
            turn_calls.clone(),
            registry.clone(),
            inner.hooks.clone(),
            context.clone(),
            resolved.parallel_tool_calling,
        );
        while let Some(event) = tool_events.recv().await {
            match event? {
                ToolEvent::Result { result, usage } => {
                    if let Some(usage) = usage {
                        context.add_usage(usage);
                    }
                    conversation.push_tool_result(
                        result.id.clone(),
                        result.name.clone(),
                        result.arguments.clone(),
                        result.result.clone(),
                    );
                    emit(tx, AgentEvent::ToolCallResult { result }).await?;
                }
                ToolEvent::Confirmation(request) => {
                    has_pending_confirmation = true;
                    turn_confirmation_ids.insert(request.confirmation_id.clone());
                    emit(tx, AgentEvent::ConfirmationRequest { request }).await?;
                }
                ToolEvent::Downstream { agent_id, event } => {
                    emit(
                        tx,
                        AgentEvent::Downstream {
                            agent_id,
                            event: Box::new(event),
                        },
                    )
                    .await?;
                }
            }
        }

        if let Some(usage) = turn_usage {
            context.add_usage(usage);
        }
        emit(tx, AgentEvent::Usage { usage: context.usage() }).await?;
        turn_count += 1;

        if has_pending_confirmation {
            if turn_confirmation_ids
                .intersection(&requested_confirmations)
                .next()
                .is_some()
            {
                tracing::warn!(
                    agent = %inner.id,
                    "confirmation ids requested twice in one run; stopping"
                );
                break;
            }
            requested_confirmations.extend(turn_confirmation_ids);
            text_only_finisher = true;
        }
    }

    if inner.keep_history {
        *inner.history.lock() = conversation.clone();
    }
    emit(
        tx,
        AgentEvent::Conversation {
            messages: conversation.into_messages(),
        },
    )
    .await?;
    Ok(())
}

/// The event stream of a run.
///
/// Besides yielding events, the stream accumulates them, so after iteration
/// the final content, tool-call results, usage and transcript are available
/// without a second pass; [`AgentRunStream::finish`] drains whatever is left
/// and returns the aggregated [`AgentResult`].
///
/// Dropping the stream cancels the run: the producer stops scheduling
/// backend calls, in-flight parallel tools are cancelled at their next
/// yield, and MCP sessions owned by the agent are cleaned up.
pub struct AgentRunStream {
    rx: mpsc::Receiver<Result<AgentEvent, AgentError>>,
    agent: Agent,
    post_processors: Vec<Arc<dyn PostProcessor>>,
    content: String,
    metadata: Map<String, Value>,
    tool_calls: Vec<ToolCallResult>,
    usage: Usage,
    history: Vec<ChatMessage>,
    downstream: HashMap<String, Vec<AgentEvent>>,
    reasoning_traces: Vec<String>,
    finished: bool,
}

impl AgentRunStream {
    fn new(
        rx: mpsc::Receiver<Result<AgentEvent, AgentError>>,
        agent: Agent,
        post_processors: Vec<Arc<dyn PostProcessor>>,
    ) -> Self {
        Self {
            rx,
            agent,
            post_processors,
            content: String::new(),
            metadata: Map::new(),
            tool_calls: Vec::new(),
            usage: Usage::default(),
            history: Vec::new(),
            downstream: HashMap::new(),
            reasoning_traces: Vec::new(),
            finished: false,
        }
    }

    /// Concatenated text of the run so far.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Latest cumulative usage.
    pub fn usage(&self) -> Usage {
        self.usage
    }

    pub fn tool_calls(&self) -> &[ToolCallResult] {
        &self.tool_calls
    }

    /// Final transcript; empty until the `conversation` event arrived.
    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Events a nested agent emitted, keyed by its id.
    pub fn downstream(&self, agent_id: &str) -> Option<&[AgentEvent]> {
        self.downstream.get(agent_id).map(Vec::as_slice)
    }

    pub fn reasoning_traces(&self) -> &[String] {
        &self.reasoning_traces
    }

    fn absorb(&mut self, event: &AgentEvent) {
        match event {
            AgentEvent::Text { content } => self.content.push_str(content),
            AgentEvent::Reasoning { content } => self.reasoning_traces.push(content.clone()),
            AgentEvent::ToolCall { .. } | AgentEvent::ConfirmationRequest { .. } => {}
            AgentEvent::ToolCallResult { result } => self.tool_calls.push(result.clone()),
            AgentEvent::Downstream { agent_id, event } => self
                .downstream
                .entry(agent_id.clone())
                .or_default()
                .push((**event).clone()),
            AgentEvent::Usage { usage } => self.usage = *usage,
            AgentEvent::Conversation { messages } => {
                self.history = messages.clone();
                self.finished = true;
            }
        }
    }

    /// Drain the remaining events and return the aggregated result.
    ///
    /// A stream that ended without its `conversation` trailer is a failed
    /// run and yields [`AgentError::RunInterrupted`].
    pub async fn finish(mut self) -> Result<AgentResult, AgentError> {
        while let Some(event) = self.next().await {
            event?;
        }
        if !self.finished {
            return Err(AgentError::RunInterrupted);
        }

        let post_processors = std::mem::take(&mut self.post_processors);
        let agent = self.agent.clone();
        let mut result = AgentResult {
            content: std::mem::take(&mut self.content),
            metadata: std::mem::take(&mut self.metadata),
            history: std::mem::take(&mut self.history),
            tool_calls: std::mem::take(&mut self.tool_calls),
            usage: self.usage,
            reasoning_traces: std::mem::take(&mut self.reasoning_traces),
        };
        for processor in &post_processors {
            result = processor.process(result, &agent).await?;
        }
        Ok(result)
    }
}

impl Stream for AgentRunStream {
    type Item = Result<AgentEvent, AgentError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(event))) => {
                this.absorb(&event);
                Poll::Ready(Some(Ok(event)))
            }
            Poll::Ready(Some(Err(error))) => Poll::Ready(Some(Err(error))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl std::fmt::Debug for AgentRunStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRunStream")
            .field("agent", &self.agent.id())
            .field("content_len", &self.content.len())
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentBuilder;
    use crate::confirmation::{
        ConfirmationDecision, PENDING_CONFIRMATION, confirmation_id,
    };
    use crate::context::AgentRunContext;
    use crate::options::AgentOptions;
    use crate::test_utils::{MockBackend, ScriptedResponse, args};
    use crate::tools::ToolDescriptor;
    use serde_json::json;
    use std::time::Duration;
    use tangent::ToolCall;

    fn echo_tool() -> ToolDescriptor {
        ToolDescriptor::function(
            "echo",
            "Echoes x back.",
            json!({"type": "object", "properties": {"x": {"type": "string"}}}),
            |arguments| async move {
                let x = arguments
                    .get("x")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                Ok(json!(format!("echo returned {x}")))
            },
        )
    }

    fn sleepy_tool(name: &str, millis: u64) -> ToolDescriptor {
        ToolDescriptor::function(name, "Sleeps.", json!({}), move |_| async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok(json!(millis))
        })
    }

    fn echo_call(id: &str, x: &str) -> ToolCall {
        ToolCall::function(id, "echo", args(&[("x", json!(x))]))
    }

    fn kind(event: &AgentEvent) -> &'static str {
        match event {
            AgentEvent::Text { .. } => "text",
            AgentEvent::Reasoning { .. } => "reasoning",
            AgentEvent::ToolCall { .. } => "tool_call",
            AgentEvent::ToolCallResult { .. } => "tool_call_result",
            AgentEvent::ConfirmationRequest { .. } => "confirmation_request",
            AgentEvent::Downstream { .. } => "downstream",
            AgentEvent::Usage { .. } => "usage",
            AgentEvent::Conversation { .. } => "conversation",
        }
    }

    async fn drain(stream: &mut AgentRunStream) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event.expect("stream error"));
        }
        events
    }

    #[tokio::test]
    async fn scenario_simple_text_stream() {
        let backend = Arc::new(MockBackend::new(vec![ScriptedResponse::text(
            "Hi",
            Usage::from_tokens(2, 1),
        )]));
        let agent = AgentBuilder::new(backend).build();

        let mut stream = agent.run_streaming("Hello");
        let events = drain(&mut stream).await;

        let kinds: Vec<_> = events.iter().map(kind).collect();
        assert_eq!(kinds, vec!["text", "usage", "conversation"]);
        assert_eq!(events[0].as_text(), Some("Hi"));
        match &events[1] {
            AgentEvent::Usage { usage } => {
                assert_eq!(usage.total_tokens, 3);
                assert_eq!(usage.requests, 1);
            }
            other => panic!("expected usage, got {other:?}"),
        }
        match &events[2] {
            AgentEvent::Conversation { messages } => {
                assert_eq!(
                    messages,
                    &vec![ChatMessage::user("Hello"), ChatMessage::assistant("Hi")]
                );
            }
            other => panic!("expected conversation, got {other:?}"),
        }

        let result = stream.finish().await.unwrap();
        assert_eq!(result.content, "Hi");
        assert_eq!(result.usage.total_tokens, 3);
        assert!(result.tool_calls.is_empty());
    }

    #[tokio::test]
    async fn scenario_confirmation_first_phase() {
        let backend = Arc::new(MockBackend::new(vec![
            ScriptedResponse::tool_calls(vec![echo_call("t1", "hello")], Usage::from_tokens(5, 2)),
            ScriptedResponse::text("I asked for your approval.", Usage::from_tokens(9, 3)),
        ]));
        let agent = AgentBuilder::new(backend.clone())
            .with_tool(echo_tool().with_confirmation(true))
            .build();

        let mut stream = agent.run_streaming("run echo hello");
        let events = drain(&mut stream).await;

        let kinds: Vec<_> = events.iter().map(kind).collect();
        assert_eq!(
            kinds,
            vec![
                "tool_call",
                "tool_call_result",
                "confirmation_request",
                "usage",
                "text",
                "usage",
                "conversation"
            ]
        );

        match &events[1] {
            AgentEvent::ToolCallResult { result } => {
                assert_eq!(result.result, json!(PENDING_CONFIRMATION));
            }
            other => panic!("expected pending result, got {other:?}"),
        }
        let expected_id = confirmation_id("echo", &args(&[("x", json!("hello"))]));
        match &events[2] {
            AgentEvent::ConfirmationRequest { request } => {
                assert_eq!(request.confirmation_id, expected_id);
                assert_eq!(request.tool_name, "echo");
            }
            other => panic!("expected confirmation request, got {other:?}"),
        }

        // The finisher turn carried no tools and no tool choice.
        let recorded = backend.recorded();
        assert_eq!(recorded.len(), 2);
        assert!(recorded[1].tool_names.is_empty());
        assert_eq!(recorded[1].tool_choice, None);

        // The pending result is visible in the transcript.
        let result = stream.finish().await.unwrap();
        assert!(result.history.iter().any(|m| matches!(
            m,
            ChatMessage::ToolResult { content, .. } if content == &json!(PENDING_CONFIRMATION)
        )));
    }

    #[tokio::test]
    async fn scenario_confirmation_second_phase_executes_once() {
        let expected_id = confirmation_id("echo", &args(&[("x", json!("hello"))]));
        let backend = Arc::new(MockBackend::new(vec![
            ScriptedResponse::tool_calls(vec![echo_call("t1", "hello")], Usage::from_tokens(5, 2)),
            ScriptedResponse::text("Done.", Usage::from_tokens(12, 2)),
        ]));
        let agent = AgentBuilder::new(backend)
            .with_tool(echo_tool().with_confirmation(true))
            .build();

        let context = AgentRunContext::new();
        context.add_confirmation(ConfirmationDecision::approve(&expected_id));

        let mut stream = agent
            .run_streaming_with("run echo hello", RunParams::new().with_context(context))
            .unwrap();
        let events = drain(&mut stream).await;

        let kinds: Vec<_> = events.iter().map(kind).collect();
        assert_eq!(
            kinds,
            vec![
                "tool_call",
                "tool_call_result",
                "usage",
                "text",
                "usage",
                "conversation"
            ]
        );
        match &events[1] {
            AgentEvent::ToolCallResult { result } => {
                assert_eq!(result.result, json!("echo returned hello"));
            }
            other => panic!("expected executed result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn scenario_declined_confirmation_skips_the_tool() {
        let expected_id = confirmation_id("echo", &args(&[("x", json!("hello"))]));
        let backend = Arc::new(MockBackend::new(vec![
            ScriptedResponse::tool_calls(vec![echo_call("t1", "hello")], Usage::from_tokens(5, 2)),
            ScriptedResponse::text("Understood.", Usage::from_tokens(10, 2)),
        ]));
        let agent = AgentBuilder::new(backend)
            .with_tool(echo_tool().with_confirmation(true))
            .build();

        let context = AgentRunContext::new();
        context.add_confirmation(ConfirmationDecision::decline(&expected_id));

        let mut stream = agent
            .run_streaming_with("run echo hello", RunParams::new().with_context(context))
            .unwrap();
        let events = drain(&mut stream).await;

        let declined = events.iter().any(|event| {
            matches!(
                event,
                AgentEvent::ToolCallResult { result }
                    if result.result.as_str().is_some_and(|s| s.to_lowercase().contains("declined"))
            )
        });
        assert!(declined);
    }

    #[tokio::test]
    async fn scenario_parallel_tools_complete_out_of_emission_order() {
        let backend = Arc::new(MockBackend::new(vec![
            ScriptedResponse::tool_calls(
                vec![
                    ToolCall::function("t1", "slow", Map::new()),
                    ToolCall::function("t2", "fast", Map::new()),
                ],
                Usage::from_tokens(6, 3),
            ),
            ScriptedResponse::text("both finished", Usage::from_tokens(12, 3)),
        ]));
        let agent = AgentBuilder::new(backend)
            .with_tool(sleepy_tool("slow", 80))
            .with_tool(sleepy_tool("fast", 5))
            .with_default_options(
                AgentOptions::new()
                    .with_parallel_tool_calling(true)
                    .with_max_turns(3),
            )
            .build();

        let mut stream = agent.run_streaming("race");
        let events = drain(&mut stream).await;

        let kinds: Vec<_> = events.iter().map(kind).collect();
        assert_eq!(
            kinds,
            vec![
                "tool_call",
                "tool_call",
                "tool_call_result",
                "tool_call_result",
                "usage",
                "text",
                "usage",
                "conversation"
            ]
        );

        let result_ids: Vec<&str> = events
            .iter()
            .filter_map(|event| match event {
                AgentEvent::ToolCallResult { result } => Some(result.id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(result_ids, vec!["t2", "t1"]);
    }

    #[tokio::test]
    async fn scenario_downstream_agent_passthrough() {
        let nested_backend = Arc::new(MockBackend::new(vec![ScriptedResponse::text(
            "forty-two",
            Usage::from_tokens(3, 2),
        )]));
        let nested = AgentBuilder::new(nested_backend)
            .with_name("ask_g")
            .with_description("Ask the G agent.")
            .build();

        let parent_backend = Arc::new(MockBackend::new(vec![
            ScriptedResponse::tool_calls(
                vec![ToolCall::function(
                    "t1",
                    "ask_g",
                    args(&[("input", json!("x"))]),
                )],
                Usage::from_tokens(6, 2),
            ),
            ScriptedResponse::text("G says forty-two.", Usage::from_tokens(12, 4)),
        ]));
        let agent = AgentBuilder::new(parent_backend)
            .with_agent_tool(&nested)
            .build();

        let context = AgentRunContext::new();
        context.set_stream_downstream_events(true);

        let mut stream = agent
            .run_streaming_with("ask", RunParams::new().with_context(context.clone()))
            .unwrap();
        let events = drain(&mut stream).await;

        // The parent emits the tool call, then the nested agent's events in
        // envelopes, then the tool's result.
        let kinds: Vec<_> = events.iter().map(kind).collect();
        let tool_call_at = kinds.iter().position(|k| *k == "tool_call").unwrap();
        let first_downstream = kinds.iter().position(|k| *k == "downstream").unwrap();
        let result_at = kinds.iter().position(|k| *k == "tool_call_result").unwrap();
        assert!(tool_call_at < first_downstream);
        assert!(first_downstream < result_at);

        let wrapped = stream.downstream(nested.id()).expect("downstream events");
        assert_eq!(
            wrapped.iter().map(kind).collect::<Vec<_>>(),
            vec!["text", "usage", "conversation"]
        );

        match &events[result_at] {
            AgentEvent::ToolCallResult { result } => {
                assert_eq!(result.result, json!("forty-two"));
                let metadata = result.metadata.as_ref().expect("nested metadata");
                assert_eq!(metadata["usage"]["total_tokens"], 5);
            }
            other => panic!("expected result, got {other:?}"),
        }

        // Nested usage accumulated into the parent run.
        let result = stream.finish().await.unwrap();
        assert_eq!(result.usage.total_tokens, 8 + 5 + 16);
        assert!(context.agent(nested.id()).is_some());
    }

    #[tokio::test]
    async fn downstream_events_are_dropped_without_passthrough() {
        let nested_backend = Arc::new(MockBackend::new(vec![ScriptedResponse::text(
            "forty-two",
            Usage::from_tokens(3, 2),
        )]));
        let nested = AgentBuilder::new(nested_backend).with_name("ask_g").build();

        let parent_backend = Arc::new(MockBackend::new(vec![
            ScriptedResponse::tool_calls(
                vec![ToolCall::function(
                    "t1",
                    "ask_g",
                    args(&[("input", json!("x"))]),
                )],
                Usage::from_tokens(6, 2),
            ),
            ScriptedResponse::text("done", Usage::from_tokens(12, 4)),
        ]));
        let agent = AgentBuilder::new(parent_backend)
            .with_agent_tool(&nested)
            .build();

        let mut stream = agent.run_streaming("ask");
        let events = drain(&mut stream).await;
        assert!(events.iter().all(|e| kind(e) != "downstream"));

        // Usage still accumulates even when events are not forwarded.
        assert_eq!(stream.usage().total_tokens, 8 + 5 + 16);
    }

    #[tokio::test]
    async fn budget_errors_terminate_without_trailers() {
        let backend = Arc::new(MockBackend::new(vec![]).with_token_count(120));
        let agent = AgentBuilder::new(backend)
            .with_default_options(AgentOptions::new().with_max_total_tokens(100))
            .build();

        let mut stream = agent.run_streaming("too long");
        let first = stream.next().await.expect("one item");
        assert!(matches!(
            first,
            Err(AgentError::NextPromptOverLimit { .. })
        ));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn turn_budget_errors_surface_mid_stream() {
        let backend = Arc::new(MockBackend::new(vec![ScriptedResponse::tool_calls(
            vec![echo_call("t1", "a")],
            Usage::from_tokens(5, 2),
        )]));
        let agent = AgentBuilder::new(backend)
            .with_tool(echo_tool())
            .with_default_options(AgentOptions::new().with_max_turns(1))
            .build();

        let mut stream = agent.run_streaming("go");
        let mut saw_error = false;
        while let Some(event) = stream.next().await {
            match event {
                Ok(event) => assert_ne!(kind(&event), "conversation"),
                Err(AgentError::MaxTurnsExceeded(1)) => saw_error = true,
                Err(other) => panic!("unexpected error {other:?}"),
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn reasoning_is_emitted_only_when_enabled() {
        let scripted = || {
            vec![
                ScriptedResponse::text("Hi", Usage::from_tokens(2, 1)).with_reasoning("hmm"),
            ]
        };

        let quiet = AgentBuilder::new(Arc::new(MockBackend::new(scripted()))).build();
        let mut stream = quiet.run_streaming("Hello");
        let events = drain(&mut stream).await;
        assert!(events.iter().all(|e| kind(e) != "reasoning"));

        let chatty = AgentBuilder::new(Arc::new(MockBackend::new(scripted())))
            .with_default_options(AgentOptions::new().with_log_reasoning(true))
            .build();
        let mut stream = chatty.run_streaming("Hello");
        let events = drain(&mut stream).await;
        assert_eq!(kind(&events[0]), "reasoning");
        assert_eq!(stream.reasoning_traces(), ["hmm"]);
    }

    #[tokio::test]
    async fn dropping_the_stream_cancels_the_run() {
        let backend = Arc::new(MockBackend::new(vec![
            ScriptedResponse::tool_calls(
                vec![ToolCall::function("t1", "slow", Map::new())],
                Usage::from_tokens(5, 2),
            ),
            ScriptedResponse::text("never sent", Usage::from_tokens(9, 2)),
        ]));
        let agent = AgentBuilder::new(backend.clone())
            .with_tool(sleepy_tool("slow", 50))
            .build();

        let mut stream = agent.run_streaming("go");
        while let Some(event) = stream.next().await {
            if kind(&event.unwrap()) == "tool_call" {
                break;
            }
        }
        drop(stream);

        tokio::time::sleep(Duration::from_millis(200)).await;
        // The producer noticed the cancellation and never started turn 2.
        assert_eq!(backend.calls_made(), 1);
    }

    #[tokio::test]
    async fn non_streaming_post_processors_are_rejected_at_entry() {
        struct Plain;

        #[async_trait::async_trait]
        impl PostProcessor for Plain {
            async fn process(
                &self,
                result: crate::agent::AgentResult,
                _agent: &Agent,
            ) -> Result<crate::agent::AgentResult, AgentError> {
                Ok(result)
            }
        }

        let backend = Arc::new(MockBackend::new(vec![]));
        let agent = AgentBuilder::new(backend).build();

        let err = agent
            .run_streaming_with(
                "go",
                RunParams::new().with_post_processor(Arc::new(Plain)),
            )
            .expect_err("non-streaming processor");
        assert!(matches!(err, AgentError::InvalidPostProcessor(_)));

        // With the explicit opt-in the same processor is accepted.
        assert!(
            agent
                .run_streaming_with(
                    "go",
                    RunParams::new()
                        .with_post_processor(Arc::new(Plain))
                        .allow_non_streaming(true),
                )
                .is_ok()
        );
    }
}

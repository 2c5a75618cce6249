//! Agent configuration and the non-streaming run loop.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;

use tangent::Usage;
use tangent::chat::{
    BackendOptions, ChatBackend, ChatMessage, Conversation, ToolChoice,
};
use tangent::mcp::{McpConfig, McpSession};

use crate::context::AgentRunContext;
use crate::error::{AgentError, TokenDimension};
use crate::hooks::{HookChain, ToolHook};
use crate::options::{AgentOptions, ResolvedOptions, TurnLimit};
use crate::post_processor::PostProcessor;
use crate::tools::invoke::{ToolEvent, spawn_dispatch};
use crate::tools::registry::build_registry;
use crate::tools::{ToolCallResult, ToolDescriptor};

/// Input to an agent run.
#[derive(Debug, Clone, Default)]
pub enum AgentInput {
    /// No input; only valid with a string prompt, which then becomes the
    /// user message.
    #[default]
    None,
    /// A plain user message.
    Text(String),
    /// Structured input for a prompt builder.
    Structured(Value),
}

impl From<&str> for AgentInput {
    fn from(text: &str) -> Self {
        AgentInput::Text(text.to_string())
    }
}

impl From<String> for AgentInput {
    fn from(text: String) -> Self {
        AgentInput::Text(text)
    }
}

impl From<Value> for AgentInput {
    fn from(value: Value) -> Self {
        AgentInput::Structured(value)
    }
}

/// Renders the starting conversation from structured input; the explicit
/// replacement for template-class prompts.
pub trait PromptBuilder: Send + Sync {
    fn build(&self, input: &AgentInput) -> Result<Conversation, AgentError>;
}

/// How the agent turns its configured prompt and the run input into the
/// starting conversation.
#[derive(Clone, Default)]
pub enum PromptSpec {
    /// No prompt; the input is used verbatim as the user message.
    #[default]
    None,
    /// A string prompt: system message when the input is a string, the user
    /// message itself when there is no input.
    Text(String),
    /// A prompt builder instantiated with the (structured) input.
    Builder(Arc<dyn PromptBuilder>),
}

impl std::fmt::Debug for PromptSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PromptSpec::None => write!(f, "None"),
            PromptSpec::Text(text) => write!(f, "Text({text:?})"),
            PromptSpec::Builder(_) => write!(f, "Builder(..)"),
        }
    }
}

/// Per-run parameters beyond the input itself.
#[derive(Clone, Default)]
pub struct RunParams {
    pub(crate) options: Option<AgentOptions>,
    pub(crate) context: Option<AgentRunContext>,
    pub(crate) tool_choice: Option<ToolChoice>,
    pub(crate) post_processors: Vec<Arc<dyn PostProcessor>>,
    pub(crate) allow_non_streaming: bool,
}

impl RunParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(mut self, options: AgentOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn with_context(mut self, context: AgentRunContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Control which tool the model uses on the first turn; later turns
    /// always revert to `auto` semantics.
    pub fn with_tool_choice(mut self, tool_choice: ToolChoice) -> Self {
        self.tool_choice = Some(tool_choice);
        self
    }

    pub fn with_post_processor(mut self, processor: Arc<dyn PostProcessor>) -> Self {
        self.post_processors.push(processor);
        self
    }

    /// Allow non-streaming post-processors on a streaming run; they then run
    /// on the aggregated result instead of the live stream.
    pub fn allow_non_streaming(mut self, allow: bool) -> Self {
        self.allow_non_streaming = allow;
        self
    }
}

/// The aggregated outcome of a run.
#[derive(Debug, Clone, Serialize)]
pub struct AgentResult {
    /// The final text completion.
    pub content: String,
    /// Provider metadata from the final response.
    pub metadata: Map<String, Value>,
    /// The full transcript, ending with the final assistant message.
    pub history: Vec<ChatMessage>,
    /// Every tool-call result produced during the run.
    pub tool_calls: Vec<ToolCallResult>,
    /// Cumulative usage.
    pub usage: Usage,
    /// Reasoning traces, when `log_reasoning` was enabled.
    pub reasoning_traces: Vec<String>,
}

pub(crate) struct AgentInner {
    pub(crate) id: String,
    pub(crate) backend: Arc<dyn ChatBackend>,
    pub(crate) name: Option<String>,
    pub(crate) description: Option<String>,
    pub(crate) prompt: PromptSpec,
    pub(crate) history: Mutex<Conversation>,
    pub(crate) keep_history: bool,
    pub(crate) tools: Vec<ToolDescriptor>,
    pub(crate) mcp_sessions: Vec<Arc<McpSession>>,
    pub(crate) owns_sessions: bool,
    pub(crate) hooks: HookChain,
    pub(crate) default_options: AgentOptions,
}

/// An agent: a backend, a prompt, a tool catalog and the loop that drives
/// them. Cheap to clone; clones share configuration and history.
#[derive(Clone)]
pub struct Agent {
    pub(crate) inner: Arc<AgentInner>,
}

impl Agent {
    pub fn builder(backend: impl ChatBackend + 'static) -> AgentBuilder {
        AgentBuilder::new(Arc::new(backend))
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.inner.description.as_deref()
    }

    /// Snapshot of the stored history (empty unless `keep_history` is set or
    /// an initial history was configured).
    pub fn history(&self) -> Vec<ChatMessage> {
        self.inner.history.lock().messages().to_vec()
    }

    /// Wrap this agent as a tool for another agent.
    pub fn as_tool(&self) -> ToolDescriptor {
        ToolDescriptor::from_agent(self)
    }

    /// Run to completion and return the aggregated result.
    pub async fn run(&self, input: impl Into<AgentInput>) -> Result<AgentResult, AgentError> {
        self.run_with(input, RunParams::new()).await
    }

    /// Run with explicit options, context, tool choice and post-processors.
    pub async fn run_with(
        &self,
        input: impl Into<AgentInput>,
        params: RunParams,
    ) -> Result<AgentResult, AgentError> {
        let input = input.into();
        let context = params.context.clone().unwrap_or_default();
        let merged = match &params.options {
            Some(options) => self.inner.default_options.merge(options),
            None => self.inner.default_options.clone(),
        };
        let resolved = merged.resolve();
        let base_options = resolved
            .backend_options
            .clone()
            .unwrap_or_else(|| self.inner.backend.default_options());

        let mut conversation = self.render_conversation(&input)?;
        let registry = build_registry(&self.inner.tools, &self.inner.mcp_sessions).await?;
        let schemas = registry.schemas();

        let mut tool_results: Vec<ToolCallResult> = Vec::new();
        let mut reasoning_traces: Vec<String> = Vec::new();
        let mut turn_count = 0usize;

        let final_response = loop {
            if let TurnLimit::Limit(limit) = resolved.max_turns
                && turn_count >= limit
            {
                return Err(AgentError::MaxTurnsExceeded(limit));
            }
            check_token_limits(
                &resolved,
                &context.usage(),
                &conversation,
                self.inner.backend.as_ref(),
            )?;
            let call_options = clamped_backend_options(&base_options, &resolved, &context.usage());
            let turn_choice = if turn_count == 0 {
                params.tool_choice.as_ref()
            } else {
                None
            };

            tracing::debug!(agent = %self.inner.id, turn = turn_count, "requesting completion");
            let response = self
                .inner
                .backend
                .generate(&conversation, &call_options, Some(schemas.as_slice()), turn_choice)
                .await?;
            context.add_usage(response.usage);

            if resolved.log_reasoning
                && let Some(reasoning) = &response.reasoning
            {
                reasoning_traces.push(reasoning.clone());
            }

            if response.tool_calls.is_empty() {
                break response;
            }

            conversation.push_assistant(response.content.clone(), response.tool_calls.clone());
            let mut rx = spawn_dispatch(
                response.tool_calls.clone(),
                registry.clone(),
                self.inner.hooks.clone(),
                context.clone(),
                resolved.parallel_tool_calling,
            );
            while let Some(event) = rx.recv().await {
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
                        tool_results.push(result);
                    }
                    // Confirmation requests and downstream events have no
                    // consumer on the aggregated path.
                    ToolEvent::Confirmation(_) | ToolEvent::Downstream { .. } => {}
                }
            }
            turn_count += 1;
        };

        conversation.push_assistant(final_response.content.clone(), vec![]);
        if self.inner.keep_history {
            *self.inner.history.lock() = conversation.clone();
        }

        let mut result = AgentResult {
            content: final_response.content,
            metadata: final_response.metadata,
            history: conversation.into_messages(),
            tool_calls: tool_results,
            usage: context.usage(),
            reasoning_traces,
        };
        for processor in &params.post_processors {
            result = processor.process(result, self).await?;
        }
        Ok(result)
    }

    /// Render the starting conversation: stored history plus the prompt
    /// rules applied to the input.
    pub(crate) fn render_conversation(
        &self,
        input: &AgentInput,
    ) -> Result<Conversation, AgentError> {
        let mut conversation = self.inner.history.lock().clone();
        match (&self.inner.prompt, input) {
            (PromptSpec::Builder(builder), input) => {
                for message in builder.build(input)?.into_messages() {
                    conversation.push(message);
                }
            }
            (PromptSpec::Text(prompt), AgentInput::Text(text)) => {
                conversation.set_system(prompt.clone());
                conversation.push_user(text.clone());
            }
            (PromptSpec::Text(prompt), AgentInput::None) => {
                conversation.push_user(prompt.clone());
            }
            (PromptSpec::None, AgentInput::Text(text)) => {
                conversation.push_user(text.clone());
            }
            (prompt, input) => {
                return Err(AgentError::InvalidPromptInput(format!(
                    "prompt {prompt:?} cannot be combined with input {input:?}"
                )));
            }
        }
        Ok(conversation)
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("tools", &self.inner.tools.len())
            .field("mcp_sessions", &self.inner.mcp_sessions.len())
            .finish()
    }
}

/// Builder for [`Agent`].
pub struct AgentBuilder {
    backend: Arc<dyn ChatBackend>,
    name: Option<String>,
    description: Option<String>,
    prompt: PromptSpec,
    history: Vec<ChatMessage>,
    keep_history: bool,
    tools: Vec<ToolDescriptor>,
    mcp_sessions: Vec<Arc<McpSession>>,
    owns_sessions: bool,
    hooks: HookChain,
    default_options: AgentOptions,
}

impl AgentBuilder {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self {
            backend,
            name: None,
            description: None,
            prompt: PromptSpec::None,
            history: Vec::new(),
            keep_history: false,
            tools: Vec::new(),
            mcp_sessions: Vec::new(),
            owns_sessions: false,
            hooks: HookChain::new(),
            default_options: AgentOptions::default(),
        }
    }

    /// Identity used when the agent is wrapped as a tool.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = PromptSpec::Text(prompt.into());
        self
    }

    pub fn with_prompt_builder(mut self, builder: Arc<dyn PromptBuilder>) -> Self {
        self.prompt = PromptSpec::Builder(builder);
        self
    }

    /// Seed the transcript with existing messages.
    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.history = history;
        self
    }

    /// Persist the transcript across runs.
    pub fn keep_history(mut self, keep: bool) -> Self {
        self.keep_history = keep;
        self
    }

    pub fn with_tool(mut self, tool: ToolDescriptor) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn with_tools(mut self, tools: impl IntoIterator<Item = ToolDescriptor>) -> Self {
        self.tools.extend(tools);
        self
    }

    /// Register another agent as a tool of this one.
    pub fn with_agent_tool(mut self, agent: &Agent) -> Self {
        self.tools.push(ToolDescriptor::from_agent(agent));
        self
    }

    /// Attach an externally managed MCP session. The agent connects lazily
    /// but never tears the session down.
    pub fn with_mcp_session(mut self, session: Arc<McpSession>) -> Self {
        self.mcp_sessions.push(session);
        self
    }

    /// Create sessions from a configuration file. Sessions created this way
    /// are owned by the agent and cleaned up when a streaming run is
    /// abandoned.
    pub fn with_mcp_config(mut self, config: McpConfig) -> Self {
        for server in config.mcp {
            self.mcp_sessions.push(Arc::new(McpSession::new(server)));
        }
        self.owns_sessions = true;
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn ToolHook>) -> Self {
        self.hooks.add(hook);
        self
    }

    pub fn with_default_options(mut self, options: AgentOptions) -> Self {
        self.default_options = options;
        self
    }

    pub fn build(self) -> Agent {
        let id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        Agent {
            inner: Arc::new(AgentInner {
                id,
                backend: self.backend,
                name: self.name,
                description: self.description,
                prompt: self.prompt,
                history: Mutex::new(Conversation::from_messages(self.history)),
                keep_history: self.keep_history,
                tools: self.tools,
                mcp_sessions: self.mcp_sessions,
                owns_sessions: self.owns_sessions,
                hooks: self.hooks,
                default_options: self.default_options,
            }),
        }
    }
}

/// Enforce the token budget before a backend call, per the configured
/// prompt/total/completion limits.
pub(crate) fn check_token_limits(
    options: &ResolvedOptions,
    usage: &Usage,
    conversation: &Conversation,
    backend: &dyn ChatBackend,
) -> Result<(), AgentError> {
    let prompt_limit = options.max_prompt_tokens.limit();
    let total_limit = options.max_total_tokens.limit();
    let completion_limit = options.max_completion_tokens.limit();

    if prompt_limit.is_some() || total_limit.is_some() {
        let next_prompt = backend.count_tokens(conversation);
        if let Some(limit) = prompt_limit
            && next_prompt > limit.saturating_sub(usage.prompt_tokens)
        {
            return Err(AgentError::MaxTokensExceeded {
                dimension: TokenDimension::Prompt,
                limit,
                observed: next_prompt,
            });
        }
        if let Some(limit) = total_limit
            && next_prompt > limit.saturating_sub(usage.total_tokens)
        {
            return Err(AgentError::NextPromptOverLimit {
                dimension: TokenDimension::Total,
                limit,
                consumed: usage.total_tokens,
                next: next_prompt,
            });
        }
    }

    if let Some(limit) = total_limit
        && usage.total_tokens > limit
    {
        return Err(AgentError::MaxTokensExceeded {
            dimension: TokenDimension::Total,
            limit,
            observed: usage.total_tokens,
        });
    }
    if let Some(limit) = prompt_limit
        && usage.prompt_tokens > limit
    {
        return Err(AgentError::MaxTokensExceeded {
            dimension: TokenDimension::Prompt,
            limit,
            observed: usage.prompt_tokens,
        });
    }
    if let Some(limit) = completion_limit
        && usage.completion_tokens > limit
    {
        return Err(AgentError::MaxTokensExceeded {
            dimension: TokenDimension::Completion,
            limit,
            observed: usage.completion_tokens,
        });
    }
    Ok(())
}

/// Clamp the forwarded `max_tokens` so a single response cannot overshoot
/// the remaining budget.
pub(crate) fn clamped_backend_options(
    base: &BackendOptions,
    options: &ResolvedOptions,
    usage: &Usage,
) -> BackendOptions {
    let Some(min_limit) = options.min_token_limit() else {
        return base.clone();
    };
    let mut clamped = base.clone();
    let remaining = min_limit.saturating_sub(usage.total_tokens);
    clamped.max_tokens = Some(remaining.min(u64::from(u32::MAX)) as u32);
    clamped
}

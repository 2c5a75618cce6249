//! Per-run tunables and their merge semantics.

use serde::{Deserialize, Serialize};

use tangent::chat::BackendOptions;

/// Bound on the number of turns in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnLimit {
    /// No bound; the caller is responsible for termination.
    Unbounded,
    Limit(usize),
}

/// Bound on a token counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenLimit {
    Unbounded,
    Limit(u64),
}

impl TokenLimit {
    pub fn limit(&self) -> Option<u64> {
        match self {
            TokenLimit::Unbounded => None,
            TokenLimit::Limit(n) => Some(*n),
        }
    }
}

/// Options for an agent run.
///
/// Every field is tri-state: `None` means "not given" and inherits from the
/// options underneath when merging; `Some(...)` overrides. Defaults are
/// applied only once, at resolution: `max_turns` falls back to 10 turns,
/// token limits to unbounded, flags to off.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentOptions {
    /// Options forwarded to the backend; `None` uses the backend's defaults.
    pub backend_options: Option<BackendOptions>,
    pub max_turns: Option<TurnLimit>,
    pub max_total_tokens: Option<TokenLimit>,
    pub max_prompt_tokens: Option<TokenLimit>,
    pub max_completion_tokens: Option<TokenLimit>,
    /// Run the turn's tool calls concurrently instead of in emission order.
    pub parallel_tool_calling: Option<bool>,
    /// Record reasoning traces and emit them as stream events.
    pub log_reasoning: Option<bool>,
}

impl AgentOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend_options(mut self, options: BackendOptions) -> Self {
        self.backend_options = Some(options);
        self
    }

    pub fn with_max_turns(mut self, turns: usize) -> Self {
        self.max_turns = Some(TurnLimit::Limit(turns));
        self
    }

    pub fn with_unbounded_turns(mut self) -> Self {
        self.max_turns = Some(TurnLimit::Unbounded);
        self
    }

    pub fn with_max_total_tokens(mut self, tokens: u64) -> Self {
        self.max_total_tokens = Some(TokenLimit::Limit(tokens));
        self
    }

    pub fn with_max_prompt_tokens(mut self, tokens: u64) -> Self {
        self.max_prompt_tokens = Some(TokenLimit::Limit(tokens));
        self
    }

    pub fn with_max_completion_tokens(mut self, tokens: u64) -> Self {
        self.max_completion_tokens = Some(TokenLimit::Limit(tokens));
        self
    }

    pub fn with_parallel_tool_calling(mut self, parallel: bool) -> Self {
        self.parallel_tool_calling = Some(parallel);
        self
    }

    pub fn with_log_reasoning(mut self, log_reasoning: bool) -> Self {
        self.log_reasoning = Some(log_reasoning);
        self
    }

    /// Overlay `other` on top of `self`: fields given on `other` win.
    pub fn merge(&self, other: &AgentOptions) -> AgentOptions {
        AgentOptions {
            backend_options: other
                .backend_options
                .clone()
                .or_else(|| self.backend_options.clone()),
            max_turns: other.max_turns.or(self.max_turns),
            max_total_tokens: other.max_total_tokens.or(self.max_total_tokens),
            max_prompt_tokens: other.max_prompt_tokens.or(self.max_prompt_tokens),
            max_completion_tokens: other.max_completion_tokens.or(self.max_completion_tokens),
            parallel_tool_calling: other.parallel_tool_calling.or(self.parallel_tool_calling),
            log_reasoning: other.log_reasoning.or(self.log_reasoning),
        }
    }

    pub(crate) fn resolve(&self) -> ResolvedOptions {
        ResolvedOptions {
            backend_options: self.backend_options.clone(),
            max_turns: self.max_turns.unwrap_or(TurnLimit::Limit(10)),
            max_total_tokens: self.max_total_tokens.unwrap_or(TokenLimit::Unbounded),
            max_prompt_tokens: self.max_prompt_tokens.unwrap_or(TokenLimit::Unbounded),
            max_completion_tokens: self.max_completion_tokens.unwrap_or(TokenLimit::Unbounded),
            parallel_tool_calling: self.parallel_tool_calling.unwrap_or(false),
            log_reasoning: self.log_reasoning.unwrap_or(false),
        }
    }
}

/// Options with run defaults applied.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedOptions {
    pub backend_options: Option<BackendOptions>,
    pub max_turns: TurnLimit,
    pub max_total_tokens: TokenLimit,
    pub max_prompt_tokens: TokenLimit,
    pub max_completion_tokens: TokenLimit,
    pub parallel_tool_calling: bool,
    pub log_reasoning: bool,
}

impl ResolvedOptions {
    /// The tightest configured token limit, if any.
    pub fn min_token_limit(&self) -> Option<u64> {
        [
            self.max_total_tokens,
            self.max_prompt_tokens,
            self.max_completion_tokens,
        ]
        .iter()
        .filter_map(TokenLimit::limit)
        .min()
    }
}

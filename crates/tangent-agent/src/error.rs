use std::fmt;
use thiserror::Error;

use tangent::error::BackendError;
use tangent::mcp::McpError;

/// Token budget dimension an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenDimension {
    Prompt,
    Completion,
    Total,
}

impl fmt::Display for TokenDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenDimension::Prompt => write!(f, "prompt"),
            TokenDimension::Completion => write!(f, "completion"),
            TokenDimension::Total => write!(f, "total"),
        }
    }
}

/// Errors surfaced by the agent runtime, distinct from backend-layer errors.
///
/// Backend and MCP errors are not caught by the loop; they pass through via
/// the transparent variants.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Two tools were registered under the same name.
    #[error("duplicate tool name `{0}`")]
    ToolDuplicate(String),
    /// The model requested a tool-call type other than `function`.
    #[error("tool call type `{0}` is not supported")]
    ToolNotSupported(String),
    /// The model referenced a tool that is not in the registry.
    #[error("tool `{0}` is not available")]
    ToolNotAvailable(String),
    /// A tool callable failed; raised after post-tool hooks have run.
    #[error("tool `{tool}` failed: {source}")]
    ToolExecution {
        tool: String,
        #[source]
        source: anyhow::Error,
    },
    /// The configured prompt cannot be combined with the given input.
    #[error("invalid prompt/input combination: {0}")]
    InvalidPromptInput(String),
    /// The loop exhausted its turn budget.
    #[error("maximum number of turns exceeded ({0})")]
    MaxTurnsExceeded(usize),
    /// A cumulative token counter crossed its limit.
    #[error("{dimension} token limit exceeded: observed {observed}, limit {limit}")]
    MaxTokensExceeded {
        dimension: TokenDimension,
        limit: u64,
        observed: u64,
    },
    /// The next backend call would overflow a token limit; raised before the call.
    #[error(
        "next prompt would exceed the {dimension} token limit: {consumed} consumed + {next} next > {limit}"
    )]
    NextPromptOverLimit {
        dimension: TokenDimension,
        limit: u64,
        consumed: u64,
        next: u64,
    },
    /// A non-streaming post-processor was registered on a streaming run
    /// without the explicit opt-in.
    #[error("invalid post-processor: {0}")]
    InvalidPostProcessor(String),
    /// The run context's dependency slot was written after it was frozen.
    #[error("dependencies are immutable after first access")]
    DependenciesFrozen,
    /// The event stream ended without its final `conversation` trailer.
    #[error("run ended before completion")]
    RunInterrupted,
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Mcp(#[from] McpError),
}

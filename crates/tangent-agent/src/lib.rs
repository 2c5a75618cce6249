//! Agent runtime on top of the `tangent` backend abstraction.
//!
//! An [`Agent`] drives a bounded multi-turn loop against a chat backend:
//! it renders the starting conversation, lets the model alternate between
//! text and tool calls, dispatches tools (optionally in parallel, optionally
//! gated on user confirmation), enforces turn and token budgets, and returns
//! either an aggregated [`AgentResult`] or a live [`AgentRunStream`] of
//! [`AgentEvent`]s.
//!
//! ```no_run
//! use serde_json::json;
//! use tangent::http::HttpBackend;
//! use tangent_agent::{Agent, ToolDescriptor};
//!
//! # async fn example() -> Result<(), tangent_agent::AgentError> {
//! let backend = HttpBackend::new("gpt-4.1-mini", "https://api.openai.com/v1");
//! let weather = ToolDescriptor::function(
//!     "weather",
//!     "Current weather for a city.",
//!     json!({"type": "object", "properties": {"city": {"type": "string"}}}),
//!     |_args| async move { Ok(json!("sunny")) },
//! );
//! let agent = Agent::builder(backend)
//!     .with_prompt("You are a terse weather assistant.")
//!     .with_tool(weather)
//!     .build();
//!
//! let result = agent.run("What's the weather in Gdansk?").await?;
//! println!("{}", result.content);
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod confirmation;
pub mod context;
pub mod error;
pub mod events;
pub mod hooks;
pub mod options;
pub mod post_processor;
pub mod streaming;
pub mod tools;

#[cfg(test)]
pub mod test_utils;

pub use agent::{Agent, AgentBuilder, AgentInput, AgentResult, PromptBuilder, PromptSpec, RunParams};
pub use confirmation::{ConfirmationDecision, ConfirmationRequest, confirmation_id};
pub use context::{AgentRunContext, Dependencies};
pub use error::{AgentError, TokenDimension};
pub use events::AgentEvent;
pub use hooks::{HookChain, HookDecision, ToolHook};
pub use options::{AgentOptions, TokenLimit, TurnLimit};
pub use post_processor::PostProcessor;
pub use streaming::AgentRunStream;
pub use tools::{ToolCallResult, ToolDescriptor, ToolRegistry};

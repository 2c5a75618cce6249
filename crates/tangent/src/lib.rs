//! Tangent is a unified interface for driving chat-completion backends.
//!
//! # Overview
//! The crate provides a consistent API for working with different chat
//! backends by abstracting away provider-specific details. It covers:
//!
//! - Chat conversations as an append-only typed transcript
//! - Streaming and non-streaming generation with tool calling
//! - Token accounting and per-model cost estimation
//! - Remote tool servers over the Model Context Protocol (MCP)
//!
//! The agent runtime that drives multi-turn loops on top of these
//! primitives lives in the `tangent-agent` crate.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::ops::{Add, AddAssign};

/// Chat conversations, the backend trait and streaming chunk types
pub mod chat;

/// Error types for the backend layer
pub mod error;

/// OpenAI-wire HTTP backend client
#[cfg(feature = "http-client")]
pub mod http;

/// Sessions to remote MCP tool servers
#[cfg(feature = "mcp")]
pub mod mcp;

/// Per-model unit prices for cost estimation
pub mod pricing;

/// Tool call represents a function call that a model wants to make.
/// This is a standardized structure used across all backends.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ToolCall {
    /// The ID of the tool call, unique within a turn.
    pub id: String,
    /// The type of the tool call (usually "function").
    #[serde(rename = "type")]
    pub call_type: String,
    /// The function to call.
    pub function: FunctionCall,
}

impl ToolCall {
    /// Convenience constructor for a `function`-typed call.
    pub fn function(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: Map<String, Value>,
    ) -> Self {
        Self {
            id: id.into(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: name.into(),
                arguments,
            },
        }
    }
}

/// FunctionCall contains details about which function to call and with what arguments.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct FunctionCall {
    /// The name of the function to call.
    pub name: String,
    /// The arguments to pass to the function, as a parsed JSON object.
    pub arguments: Map<String, Value>,
}

/// Cumulative token accounting for a response or a whole run.
///
/// `Usage` composes as a monoid: [`Usage::default`] is the zero value and
/// addition is pointwise. Backends report one `Usage` per response with
/// `requests == 1`; callers fold them to obtain run totals.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
pub struct Usage {
    /// Number of prompt (input) tokens.
    #[serde(alias = "input_tokens")]
    pub prompt_tokens: u64,
    /// Number of completion (output) tokens.
    #[serde(alias = "output_tokens")]
    pub completion_tokens: u64,
    /// Total tokens billed for the request.
    pub total_tokens: u64,
    /// Number of backend requests this value accounts for.
    #[serde(default)]
    pub requests: u64,
    /// Estimated monetary cost in USD, derived from per-model unit prices.
    #[serde(default)]
    pub estimated_cost: f64,
}

impl Usage {
    /// Usage of a single request with the given token counts.
    pub fn from_tokens(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            requests: 1,
            estimated_cost: 0.0,
        }
    }

    /// Same counts with the cost filled in from a price table.
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.estimated_cost = cost;
        self
    }
}

impl Add for Usage {
    type Output = Usage;

    fn add(self, rhs: Usage) -> Usage {
        Usage {
            prompt_tokens: self.prompt_tokens + rhs.prompt_tokens,
            completion_tokens: self.completion_tokens + rhs.completion_tokens,
            total_tokens: self.total_tokens + rhs.total_tokens,
            requests: self.requests + rhs.requests,
            estimated_cost: self.estimated_cost + rhs.estimated_cost,
        }
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Usage) {
        *self = *self + rhs;
    }
}

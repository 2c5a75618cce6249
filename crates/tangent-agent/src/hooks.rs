//! Pre- and post-tool hook chains.
//!
//! Hooks compose left to right. A pre-tool hook may rewrite the arguments,
//! deny the invocation with a reason, or defer it to the caller with a
//! confirmation request; `deny` and `ask` short-circuit the rest of the
//! chain. Post-tool hooks see the raw outcome (value or error) and may
//! replace the value.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

use tangent::ToolCall;

use crate::confirmation::ConfirmationRequest;
use crate::context::AgentRunContext;

/// Outcome of the pre-tool hook chain.
#[derive(Debug, Clone)]
pub enum HookDecision {
    /// Proceed, possibly with rewritten arguments.
    Allow(Map<String, Value>),
    /// Skip the invocation; the reason becomes the tool result.
    Deny(String),
    /// Pause the invocation and ask the caller for approval.
    Ask(ConfirmationRequest),
}

/// A user-supplied observer/mutator of tool invocations.
#[async_trait]
pub trait ToolHook: Send + Sync {
    /// Runs before the tool executes. The call's arguments reflect any
    /// rewrites made by earlier hooks in the chain.
    async fn before_tool(&self, call: &ToolCall, _context: &AgentRunContext) -> HookDecision {
        HookDecision::Allow(call.function.arguments.clone())
    }

    /// Runs after the tool executed (or failed). Return `Some` to replace
    /// the tool's value; errors cannot be swallowed here.
    async fn after_tool(
        &self,
        _call: &ToolCall,
        _outcome: Result<&Value, &anyhow::Error>,
    ) -> Option<Value> {
        None
    }
}

/// An ordered chain of hooks.
#[derive(Clone, Default)]
pub struct HookChain {
    hooks: Vec<Arc<dyn ToolHook>>,
}

impl HookChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, hook: Arc<dyn ToolHook>) -> &mut Self {
        self.hooks.push(hook);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Fold the pre-tool chain over the call. Each `Allow` threads its
    /// (possibly rewritten) arguments into the next hook; `Deny`/`Ask` stop
    /// the fold.
    pub async fn run_before(&self, call: &ToolCall, context: &AgentRunContext) -> HookDecision {
        let mut current = call.clone();
        for hook in &self.hooks {
            match hook.before_tool(&current, context).await {
                HookDecision::Allow(arguments) => current.function.arguments = arguments,
                decision @ (HookDecision::Deny(_) | HookDecision::Ask(_)) => return decision,
            }
        }
        HookDecision::Allow(current.function.arguments)
    }

    /// Run the post-tool chain on the raw outcome; the last replacement wins.
    pub async fn run_after(
        &self,
        call: &ToolCall,
        value: Option<&Value>,
        error: Option<&anyhow::Error>,
    ) -> Option<Value> {
        let mut replacement: Option<Value> = None;
        for hook in &self.hooks {
            let outcome: Result<&Value, &anyhow::Error> = match (&replacement, value, error) {
                (Some(replaced), _, None) => Ok(replaced),
                (None, Some(v), None) => Ok(v),
                (_, _, Some(e)) => Err(e),
                (None, None, None) => continue,
            };
            if let Some(new_value) = hook.after_tool(call, outcome).await {
                replacement = Some(new_value);
            }
        }
        replacement
    }
}

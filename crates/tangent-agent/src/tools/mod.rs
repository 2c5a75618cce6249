//! Tool descriptors and their invocation machinery.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tangent::chat::ToolSchema;

use crate::agent::Agent;
use crate::context::AgentRunContext;

pub(crate) mod invoke;
pub mod registry;

pub use registry::ToolRegistry;

/// Arguments a tool is invoked with.
pub type ToolArgs = Map<String, Value>;

type ToolFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;
type Callable = Arc<dyn Fn(ToolArgs, Option<AgentRunContext>) -> ToolFuture + Send + Sync>;

/// What a descriptor dispatches to.
#[derive(Clone)]
pub(crate) enum ToolKind {
    /// A plain callable.
    Function(Callable),
    /// A nested agent run as a tool; its stream is re-emitted downstream.
    Agent(Agent),
}

/// A tool exposed to the model.
#[derive(Clone)]
pub struct ToolDescriptor {
    name: String,
    description: String,
    parameters: Value,
    requires_confirmation: bool,
    takes_context: bool,
    kind: ToolKind,
}

impl ToolDescriptor {
    /// An async tool from a callable taking the parsed arguments.
    pub fn function<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        f: F,
    ) -> Self
    where
        F: Fn(ToolArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let callable: Callable = Arc::new(move |args, _context| Box::pin(f(args)));
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            requires_confirmation: false,
            takes_context: false,
            kind: ToolKind::Function(callable),
        }
    }

    /// An async tool whose callable also receives the run context.
    pub fn function_with_context<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        f: F,
    ) -> Self
    where
        F: Fn(ToolArgs, AgentRunContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let callable: Callable = Arc::new(move |args, context| {
            // The invoker always passes a context for context-taking tools.
            let context = context.unwrap_or_default();
            Box::pin(f(args, context))
        });
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            requires_confirmation: false,
            takes_context: true,
            kind: ToolKind::Function(callable),
        }
    }

    /// A synchronous tool; runs on the blocking thread pool so it cannot
    /// stall event emission.
    pub fn blocking<F>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        f: F,
    ) -> Self
    where
        F: Fn(ToolArgs) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let callable: Callable = Arc::new(move |args, _context| {
            let f = Arc::clone(&f);
            Box::pin(async move {
                tokio::task::spawn_blocking(move || f(args))
                    .await
                    .map_err(|e| anyhow::anyhow!("blocking tool panicked: {e}"))?
            })
        });
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            requires_confirmation: false,
            takes_context: false,
            kind: ToolKind::Function(callable),
        }
    }

    /// Wrap an agent as a tool of another agent.
    ///
    /// Invoking it runs the nested agent's streaming API on the `input`
    /// argument; events are re-emitted into the parent stream when the run
    /// context enables downstream passthrough.
    pub fn from_agent(agent: &Agent) -> Self {
        let name = agent
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("agent_{}", agent.id()));
        let description = agent
            .description()
            .unwrap_or("Delegate a task to a nested agent.")
            .to_string();
        Self {
            name,
            description,
            parameters: json!({
                "type": "object",
                "properties": {
                    "input": {
                        "type": "string",
                        "description": "Input passed to the nested agent.",
                    }
                },
                "required": ["input"],
            }),
            requires_confirmation: false,
            takes_context: false,
            kind: ToolKind::Agent(agent.clone()),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Gate the tool behind the confirmation handshake.
    pub fn with_confirmation(mut self, requires_confirmation: bool) -> Self {
        self.requires_confirmation = requires_confirmation;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn parameters(&self) -> &Value {
        &self.parameters
    }

    pub fn requires_confirmation(&self) -> bool {
        self.requires_confirmation
    }

    pub fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }

    pub(crate) fn kind(&self) -> &ToolKind {
        &self.kind
    }

    pub(crate) fn takes_context(&self) -> bool {
        self.takes_context
    }
}

impl std::fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("requires_confirmation", &self.requires_confirmation)
            .field(
                "kind",
                &match self.kind {
                    ToolKind::Function(_) => "function",
                    ToolKind::Agent(_) => "agent",
                },
            )
            .finish()
    }
}

/// Outcome of one tool call as it lands in the transcript and the result
/// list: the call identity, the arguments as invoked (after hook mutation),
/// the returned value and optional metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallResult {
    pub id: String,
    pub name: String,
    pub arguments: Map<String, Value>,
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

//! Registry of the tools available to one agent for one turn.

use std::collections::HashMap;
use std::sync::Arc;

use tangent::chat::ToolSchema;
use tangent::mcp::{McpSession, McpToolInfo};

use crate::error::AgentError;
use crate::tools::ToolDescriptor;

/// Uniquely named tools, in registration order.
///
/// Rebuilt before each turn from the agent's local tools plus the listings of
/// its MCP sessions; any name collision is a hard error.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    order: Vec<String>,
    tools: HashMap<String, ToolDescriptor>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_descriptors(
        descriptors: impl IntoIterator<Item = ToolDescriptor>,
    ) -> Result<Self, AgentError> {
        let mut registry = Self::new();
        for descriptor in descriptors {
            registry.insert(descriptor)?;
        }
        Ok(registry)
    }

    pub fn insert(&mut self, descriptor: ToolDescriptor) -> Result<(), AgentError> {
        let name = descriptor.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(AgentError::ToolDuplicate(name));
        }
        self.order.push(name.clone());
        self.tools.insert(name, descriptor);
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    /// Schemas to pass to the backend, in registration order.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(ToolDescriptor::schema)
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Adapt a tool advertised by an MCP server into a local descriptor that
/// forwards invocations over the session.
pub(crate) fn remote_tool(session: Arc<McpSession>, info: McpToolInfo) -> ToolDescriptor {
    let tool_name = info.name.clone();
    ToolDescriptor::function(
        info.name,
        info.description,
        info.schema,
        move |args| {
            let session = Arc::clone(&session);
            let tool_name = tool_name.clone();
            async move {
                let value = session.call_tool(&tool_name, args).await?;
                Ok(value)
            }
        },
    )
}

/// Build the turn's registry: local tools first, then the union of every
/// session's tool listing. Sessions connect lazily here.
pub(crate) async fn build_registry(
    local: &[ToolDescriptor],
    sessions: &[Arc<McpSession>],
) -> Result<ToolRegistry, AgentError> {
    let mut registry = ToolRegistry::from_descriptors(local.iter().cloned())?;
    for session in sessions {
        session.ensure_connected().await?;
        for info in session.list_tools().await? {
            registry.insert(remote_tool(Arc::clone(session), info))?;
        }
    }
    Ok(registry)
}

//! Sessions to remote tool servers speaking the Model Context Protocol.
//!
//! A server is described by an [`McpServerConfig`] (stdio, SSE or streamable
//! HTTP transport) and driven through an [`McpSession`] with an explicit
//! `connect`/`cleanup` lifecycle and a cached tool listing.

use serde_json::{Map, Value};
use thiserror::Error;

pub mod config;
pub mod session;

pub use config::{McpConfig, McpServerConfig, McpTransport};
pub use session::{McpSession, McpSessionScope, SessionState};

/// Errors from the MCP session layer.
#[derive(Debug, Error)]
pub enum McpError {
    /// An operation that needs a live session was called without one.
    #[error("MCP server `{0}` is not connected; call `connect()` first")]
    NotConnected(String),
    /// The transport could not be set up (bad command, bad URL, bad headers).
    #[error("failed to start MCP transport for `{name}`: {detail}")]
    Transport { name: String, detail: String },
    /// Transport came up but the initialize handshake failed.
    #[error("MCP handshake with `{name}` failed: {detail}")]
    Handshake { name: String, detail: String },
    /// A request on an established session failed.
    #[error("MCP request to `{name}` failed: {detail}")]
    Request { name: String, detail: String },
    /// The configuration file or record is invalid.
    #[error("invalid MCP configuration: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A tool advertised by an MCP server, reduced to the transport-independent
/// fields the registry needs.
#[derive(Debug, Clone, PartialEq)]
pub struct McpToolInfo {
    pub name: String,
    pub description: String,
    /// JSON-Schema for the tool's arguments.
    pub schema: Value,
}

impl From<rmcp::model::Tool> for McpToolInfo {
    fn from(tool: rmcp::model::Tool) -> Self {
        let mut schema_map: Map<String, Value> = Map::new();
        for (k, v) in tool.input_schema.as_ref().iter() {
            schema_map.insert(k.clone(), v.clone());
        }
        McpToolInfo {
            name: tool.name.into_owned(),
            description: tool.description.into_owned(),
            schema: Value::Object(schema_map),
        }
    }
}

/// Cached tool listing with an explicit dirty flag.
///
/// The cache starts dirty so tools are fetched at least once.
#[derive(Debug)]
pub(crate) struct ToolsCache {
    tools: Option<Vec<McpToolInfo>>,
    dirty: bool,
}

impl Default for ToolsCache {
    fn default() -> Self {
        Self {
            tools: None,
            dirty: true,
        }
    }
}

impl ToolsCache {
    /// The cached listing, when caching is enabled and the cache is clean.
    pub(crate) fn cached(&self, enabled: bool) -> Option<Vec<McpToolInfo>> {
        if enabled && !self.dirty {
            self.tools.clone()
        } else {
            None
        }
    }

    pub(crate) fn store(&mut self, tools: Vec<McpToolInfo>) {
        self.tools = Some(tools);
        self.dirty = false;
    }

    pub(crate) fn invalidate(&mut self) {
        self.dirty = true;
    }
}

use rmcp::{
    RoleClient,
    model::{CallToolRequestParam, Implementation, InitializeResult},
    service::{DynService, RunningService},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use super::{McpError, McpServerConfig, McpToolInfo, ToolsCache};

/// Connection state of an [`McpSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

type ClientService = RunningService<RoleClient, Box<dyn DynService<RoleClient>>>;

struct SessionInner {
    state: SessionState,
    service: Option<ClientService>,
    initialize_result: Option<InitializeResult>,
    cache: ToolsCache,
}

/// A long-lived session to one MCP server.
///
/// All operations take `&self`; the session serializes connect, request and
/// cleanup through one internal mutex, so connects can never interleave with
/// teardown.
pub struct McpSession {
    config: McpServerConfig,
    client_impl: Implementation,
    inner: Mutex<SessionInner>,
}

impl McpSession {
    pub fn new(config: McpServerConfig) -> Self {
        Self::with_client_impl(
            config,
            Implementation {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
        )
    }

    pub fn with_client_impl(config: McpServerConfig, client_impl: Implementation) -> Self {
        Self {
            config,
            client_impl,
            inner: Mutex::new(SessionInner {
                state: SessionState::Disconnected,
                service: None,
                initialize_result: None,
                cache: ToolsCache::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &McpServerConfig {
        &self.config
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    /// The server's initialize handshake result, when connected.
    pub async fn initialize_result(&self) -> Option<InitializeResult> {
        self.inner.lock().await.initialize_result.clone()
    }

    /// Connect to the server. Already-connected sessions are left untouched.
    ///
    /// On any failure during transport setup or handshake, a full teardown
    /// runs before the error propagates.
    pub async fn connect(&self) -> Result<(), McpError> {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Connected {
            return Ok(());
        }
        inner.state = SessionState::Connecting;

        match self
            .config
            .transport
            .start(&self.config.name, &self.client_impl)
            .await
        {
            Ok(service) => {
                inner.initialize_result = service.peer_info().cloned();
                inner.service = Some(service);
                inner.state = SessionState::Connected;
                Ok(())
            }
            Err(e) => {
                log::error!("error initializing MCP server `{}`: {e}", self.config.name);
                Self::teardown(&mut inner).await;
                Err(e)
            }
        }
    }

    /// Connect unless already connected; used by callers that connect lazily.
    pub async fn ensure_connected(&self) -> Result<(), McpError> {
        self.connect().await
    }

    /// Tear the session down. Safe to call in any state.
    pub async fn cleanup(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = SessionState::Closing;
        Self::teardown(&mut inner).await;
    }

    async fn teardown(inner: &mut SessionInner) {
        if let Some(service) = inner.service.take()
            && let Err(e) = service.cancel().await
        {
            log::warn!("error cleaning up MCP session: {e}");
        }
        inner.initialize_result = None;
        inner.state = SessionState::Closed;
    }

    /// List the tools available on the server.
    ///
    /// Serves the cached listing when `cache_tools` is set and the cache is
    /// clean; otherwise fetches from the server, caches the result and clears
    /// the dirty flag.
    pub async fn list_tools(&self) -> Result<Vec<McpToolInfo>, McpError> {
        let mut inner = self.inner.lock().await;
        let name = self.config.name.clone();
        let peer = {
            let Some(service) = inner.service.as_ref() else {
                return Err(McpError::NotConnected(name));
            };
            service.peer().clone()
        };

        if let Some(cached) = inner.cache.cached(self.config.cache_tools) {
            return Ok(cached);
        }

        let tools = peer
            .list_all_tools()
            .await
            .map_err(|e| McpError::Request {
                name,
                detail: e.to_string(),
            })?
            .into_iter()
            .map(McpToolInfo::from)
            .collect::<Vec<_>>();

        inner.cache.store(tools.clone());
        Ok(tools)
    }

    /// Mark the cached tool listing stale; the next
    /// [`McpSession::list_tools`] call round-trips to the server.
    pub async fn invalidate_tools_cache(&self) {
        self.inner.lock().await.cache.invalidate();
    }

    /// Invoke a tool on the server and return its result payload.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<Value, McpError> {
        let inner = self.inner.lock().await;
        let server = self.config.name.clone();
        let Some(service) = inner.service.as_ref() else {
            return Err(McpError::NotConnected(server));
        };
        let peer = service.peer().clone();
        drop(inner);

        let result = peer
            .call_tool(CallToolRequestParam {
                name: name.to_string().into(),
                arguments: Some(arguments),
            })
            .await
            .map_err(|e| McpError::Request {
                name: server,
                detail: e.to_string(),
            })?;
        Ok(serde_json::to_value(&result)?)
    }

    /// Enter a scope that is connected on entry and expects
    /// [`McpSessionScope::close`] on exit.
    pub async fn enter(&self) -> Result<McpSessionScope<'_>, McpError> {
        self.connect().await?;
        Ok(McpSessionScope {
            session: self,
            closed: false,
        })
    }
}

/// Scoped handle over a connected [`McpSession`].
///
/// Call [`McpSessionScope::close`] when done; a scope dropped without closing
/// leaves the session connected and logs a warning.
pub struct McpSessionScope<'a> {
    session: &'a McpSession,
    closed: bool,
}

impl McpSessionScope<'_> {
    pub async fn close(mut self) {
        self.closed = true;
        self.session.cleanup().await;
    }
}

impl std::ops::Deref for McpSessionScope<'_> {
    type Target = McpSession;

    fn deref(&self) -> &McpSession {
        self.session
    }
}

impl Drop for McpSessionScope<'_> {
    fn drop(&mut self) {
        if !self.closed {
            log::warn!(
                "MCP session scope for `{}` dropped without close(); session left connected",
                self.session.name()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::McpTransport;

    fn stdio_config(command: &str) -> McpServerConfig {
        McpServerConfig {
            name: "test".to_string(),
            cache_tools: false,
            transport: McpTransport::Stdio {
                command: command.to_string(),
                args: vec![],
                env: Default::default(),
                cwd: None,
            },
        }
    }

    #[tokio::test]
    async fn starts_disconnected() {
        let session = McpSession::new(stdio_config("mcp-files"));
        assert_eq!(session.state().await, SessionState::Disconnected);
        assert!(session.initialize_result().await.is_none());
    }

    #[tokio::test]
    async fn operations_require_a_connection() {
        let session = McpSession::new(stdio_config("mcp-files"));
        assert!(matches!(
            session.list_tools().await,
            Err(McpError::NotConnected(_))
        ));
        assert!(matches!(
            session.call_tool("search", Map::new()).await,
            Err(McpError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn failed_connect_tears_down() {
        let session = McpSession::new(stdio_config("definitely-not-a-real-command-7f3a"));
        let err = session.connect().await.expect_err("command should not exist");
        assert!(matches!(err, McpError::Transport { .. }));
        assert_eq!(session.state().await, SessionState::Closed);
    }

    #[tokio::test]
    async fn cleanup_is_safe_when_disconnected() {
        let session = McpSession::new(stdio_config("mcp-files"));
        session.cleanup().await;
        assert_eq!(session.state().await, SessionState::Closed);
    }
}

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use rmcp::{
    RoleClient, ServiceExt,
    model::{ClientCapabilities, ClientInfo, Implementation, ProtocolVersion},
    service::{DynService, RunningService},
    transport::{
        SseClientTransport, StreamableHttpClientTransport, sse_client::SseClientConfig,
        streamable_http_client::StreamableHttpClientTransportConfig,
    },
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path, process::Stdio, time::Duration};
use which::which;

use super::McpError;

fn default_http_timeout() -> f64 {
    5.0
}

fn default_read_timeout() -> f64 {
    300.0
}

fn default_terminate_on_close() -> bool {
    true
}

/// Top-level configuration file: a list of `[[mcp]]` server entries.
#[derive(Debug, Serialize, Deserialize)]
pub struct McpConfig {
    pub mcp: Vec<McpServerConfig>,
}

impl McpConfig {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, McpError> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: Self =
            toml::from_str(&content).map_err(|e| McpError::Config(e.to_string()))?;
        Ok(config)
    }
}

/// One configured MCP server.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct McpServerConfig {
    pub name: String,
    /// Cache the server's tool listing between turns. Invalidate with
    /// [`super::McpSession::invalidate_tools_cache`] when the server is known
    /// to change its tools.
    #[serde(default)]
    pub cache_tools: bool,
    #[serde(flatten)]
    pub transport: McpTransport,
}

/// Transport used to reach an MCP server.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum McpTransport {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        cwd: Option<String>,
    },
    Sse {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        /// Timeout for establishing the HTTP connection, in seconds.
        #[serde(default = "default_http_timeout")]
        http_timeout: f64,
        /// Timeout for reading the next event, in seconds.
        #[serde(default = "default_read_timeout")]
        read_timeout: f64,
    },
    #[serde(rename = "http")]
    StreamableHttp {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default = "default_http_timeout")]
        http_timeout: f64,
        #[serde(default = "default_read_timeout")]
        read_timeout: f64,
        #[serde(default = "default_terminate_on_close")]
        terminate_on_close: bool,
    },
}

fn header_map(name: &str, headers: &HashMap<String, String>) -> Result<HeaderMap, McpError> {
    let mut map = HeaderMap::new();
    for (key, value) in headers {
        let header_name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| {
            McpError::Config(format!("invalid header name `{key}` for `{name}`: {e}"))
        })?;
        let header_value = HeaderValue::from_str(value).map_err(|e| {
            McpError::Config(format!("invalid header value for `{key}` on `{name}`: {e}"))
        })?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}

fn http_client(
    name: &str,
    headers: &HashMap<String, String>,
    http_timeout: f64,
    read_timeout: f64,
) -> Result<reqwest::Client, McpError> {
    reqwest::ClientBuilder::new()
        .default_headers(header_map(name, headers)?)
        .connect_timeout(Duration::from_secs_f64(http_timeout))
        .read_timeout(Duration::from_secs_f64(read_timeout))
        .build()
        .map_err(|e| McpError::Transport {
            name: name.to_string(),
            detail: e.to_string(),
        })
}

impl McpTransport {
    /// Build the transport, perform the initialize handshake and return the
    /// running client service.
    pub(crate) async fn start(
        &self,
        name: &str,
        client_impl: &Implementation,
    ) -> Result<RunningService<RoleClient, Box<dyn DynService<RoleClient>>>, McpError> {
        let client_info = ClientInfo {
            protocol_version: ProtocolVersion::default(),
            capabilities: ClientCapabilities::default(),
            client_info: client_impl.clone(),
        };
        let handshake_err = |e: &dyn std::fmt::Display| McpError::Handshake {
            name: name.to_string(),
            detail: e.to_string(),
        };

        let client = match self {
            McpTransport::Sse {
                url,
                headers,
                http_timeout,
                read_timeout,
            } => {
                let client = http_client(name, headers, *http_timeout, *read_timeout)?;
                let transport = SseClientTransport::start_with_client(
                    client,
                    SseClientConfig {
                        sse_endpoint: url.clone().into(),
                        ..Default::default()
                    },
                )
                .await
                .map_err(|e| McpError::Transport {
                    name: name.to_string(),
                    detail: e.to_string(),
                })?;
                client_info
                    .into_dyn()
                    .serve(transport)
                    .await
                    .map_err(|e| handshake_err(&e))?
            }
            McpTransport::StreamableHttp {
                url,
                headers,
                http_timeout,
                read_timeout,
                ..
            } => {
                let client = http_client(name, headers, *http_timeout, *read_timeout)?;
                let transport = StreamableHttpClientTransport::with_client(
                    client,
                    StreamableHttpClientTransportConfig {
                        uri: url.clone().into(),
                        ..Default::default()
                    },
                );
                client_info
                    .into_dyn()
                    .serve(transport)
                    .await
                    .map_err(|e| handshake_err(&e))?
            }
            McpTransport::Stdio { command, .. }
                if !(which(command).is_ok() || Path::new(&command).exists()) =>
            {
                return Err(McpError::Transport {
                    name: name.to_string(),
                    detail: format!("command not found: {command}"),
                });
            }
            McpTransport::Stdio {
                command,
                args,
                env,
                cwd,
            } => {
                let mut cmd = tokio::process::Command::new(command);
                cmd.args(args)
                    .envs(env)
                    .stderr(Stdio::inherit())
                    .stdout(Stdio::piped())
                    .stdin(Stdio::piped());
                if let Some(cwd) = cwd {
                    cmd.current_dir(cwd);
                }
                let transport = rmcp::transport::child_process::TokioChildProcess::new(cmd)
                    .map_err(|e| McpError::Transport {
                        name: name.to_string(),
                        detail: e.to_string(),
                    })?;
                client_info
                    .into_dyn()
                    .serve(transport)
                    .await
                    .map_err(|e| handshake_err(&e))?
            }
        };
        log::trace!("connected to MCP server `{}`: {:#?}", name, client.peer_info());
        Ok(client)
    }
}

//! Narrow transport capability consumed by the core.
//!
//! The supervisor never touches rmcp directly: it drives a [`Transport`]
//! that can be started, closed, asked for tools, and asked to invoke one.
//! [`RmcpFactory`] is the production implementation covering the three wire
//! shapes (child-process stdio, streamable HTTP, SSE); tests substitute
//! their own factory.

pub mod env;

use crate::config::{Protocol, ServerConfig};
use async_trait::async_trait;
use rmcp::{
    model::CallToolRequestParam,
    service::{NotificationContext, RoleClient, RunningService},
    transport::{
        sse_client::SseClientConfig, streamable_http_client::StreamableHttpClientTransportConfig,
        SseClientTransport, StreamableHttpClientTransport, TokioChildProcess,
    },
    ClientHandler, ServiceExt,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Transport-level failure, classified where the transport can tell and by
/// message scanning where it cannot.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The connection is gone; reconnect to recover.
    #[error("transport broken: {0}")]
    Broken(String),
    /// The upstream rejected our credentials (or their absence).
    #[error("authorization required: {0}")]
    Unauthorized(String),
    #[error("invalid transport config: {0}")]
    Config(String),
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    pub fn is_unauthorized(&self) -> bool {
        match self {
            TransportError::Unauthorized(_) => true,
            TransportError::Broken(msg) | TransportError::Other(msg) => {
                message_looks_unauthorized(msg)
            }
            TransportError::Config(_) => false,
        }
    }

    pub fn is_broken(&self) -> bool {
        match self {
            TransportError::Broken(_) => true,
            TransportError::Unauthorized(_) | TransportError::Config(_) => false,
            TransportError::Other(msg) => message_looks_broken(msg),
        }
    }
}

/// Substring fallback for upstreams that only surface stringly errors.
pub fn message_looks_unauthorized(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("authorization required")
        || lower.contains("no valid token available")
        || lower.contains("unauthorized")
        || lower.contains("401")
}

/// Substring fallback for broken-connection detection.
pub fn message_looks_broken(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["broken pipe", "connection reset", "eof", "connection refused", "transport error", "transport closed"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// Classify an arbitrary error message into a [`TransportError`].
pub fn classify_message(message: impl Into<String>) -> TransportError {
    let message = message.into();
    if message_looks_unauthorized(&message) {
        TransportError::Unauthorized(message)
    } else if message_looks_broken(&message) {
        TransportError::Broken(message)
    } else {
        TransportError::Other(message)
    }
}

/// Identity the upstream reported during the MCP handshake.
#[derive(Debug, Clone, Default)]
pub struct UpstreamInfo {
    pub name: String,
    pub version: String,
    pub supports_tools: bool,
}

/// One tool definition as reported by `tools/list`.
#[derive(Debug, Clone)]
pub struct ToolDef {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: serde_json::Value,
}

/// Result of one `tools/call`.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    /// Text content blocks, joined with newlines.
    pub content: String,
    pub is_error: bool,
}

/// Out-of-band notice from the upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportNotification {
    ToolListChanged,
}

pub type NotificationHook = Arc<dyn Fn(TransportNotification) + Send + Sync>;

/// The capability the core consumes. One instance per connection attempt.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection and perform the MCP handshake.
    async fn start(&mut self) -> Result<UpstreamInfo, TransportError>;

    /// Close the connection. Safe to call on a never-started transport.
    async fn close(&mut self);

    async fn list_tools(&self) -> Result<Vec<ToolDef>, TransportError>;

    async fn call_tool(
        &self,
        name: &str,
        args: serde_json::Value,
    ) -> Result<ToolOutcome, TransportError>;

    /// Register a notification observer; call before [`start`](Transport::start).
    fn set_notification_hook(&mut self, hook: NotificationHook);
}

/// Per-connection knobs the Core Client injects on top of the config.
#[derive(Clone, Default)]
pub struct TransportOptions {
    pub headers: BTreeMap<String, String>,
    /// Bearer token for HTTP/SSE; carried explicitly rather than smuggled
    /// through the header map.
    pub auth_token: Option<String>,
}

/// Builds transports from config. Injected into the Core Client so tests
/// can substitute scripted fakes.
pub trait TransportFactory: Send + Sync {
    fn build(
        &self,
        config: &ServerConfig,
        options: TransportOptions,
    ) -> Result<Box<dyn Transport>, TransportError>;
}

/// Production factory over the rmcp SDK.
pub struct RmcpFactory;

impl TransportFactory for RmcpFactory {
    fn build(
        &self,
        config: &ServerConfig,
        options: TransportOptions,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let protocol = config.protocol.resolve(config);
        match protocol {
            Protocol::Stdio => {
                if config.command.is_none() {
                    return Err(TransportError::Config(format!(
                        "server '{}' selects stdio but has no command",
                        config.name
                    )));
                }
            }
            _ => {
                if config.url.is_empty() {
                    return Err(TransportError::Config(format!(
                        "server '{}' selects {:?} but has no url",
                        config.name, protocol
                    )));
                }
            }
        }
        Ok(Box::new(RmcpTransport {
            config: Arc::new(config.clone()),
            options,
            hook: None,
            service: None,
        }))
    }
}

type McpService = RunningService<RoleClient, HerdClientHandler>;

/// Client-side handler: default MCP client behavior plus a hook for
/// tool-list-changed notifications.
#[derive(Clone)]
struct HerdClientHandler {
    hook: Option<NotificationHook>,
}

impl ClientHandler for HerdClientHandler {
    async fn on_tool_list_changed(&self, _context: NotificationContext<RoleClient>) {
        debug!("upstream reported tool list changed");
        if let Some(hook) = &self.hook {
            hook(TransportNotification::ToolListChanged);
        }
    }
}

/// rmcp-backed transport covering stdio, streamable HTTP, and SSE.
pub struct RmcpTransport {
    config: Arc<ServerConfig>,
    options: TransportOptions,
    hook: Option<NotificationHook>,
    service: Option<McpService>,
}

impl RmcpTransport {
    fn service(&self) -> Result<&McpService, TransportError> {
        self.service
            .as_ref()
            .ok_or_else(|| TransportError::Broken("transport not started".to_string()))
    }

    /// HTTP client carrying the configured headers plus the bearer token.
    fn build_http_client(&self) -> Result<reqwest::Client, TransportError> {
        let mut map = reqwest::header::HeaderMap::new();
        for (key, value) in self.config.headers.iter().chain(self.options.headers.iter()) {
            let name = reqwest::header::HeaderName::from_bytes(key.as_bytes())
                .map_err(|_| TransportError::Config(format!("invalid header name {key}")))?;
            let value = reqwest::header::HeaderValue::from_str(value)
                .map_err(|_| TransportError::Config(format!("invalid header value for {key}")))?;
            map.insert(name, value);
        }
        if let Some(token) = &self.options.auth_token {
            let value = reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| TransportError::Config("invalid bearer token".to_string()))?;
            map.insert(reqwest::header::AUTHORIZATION, value);
        }
        reqwest::Client::builder()
            .default_headers(map)
            .build()
            .map_err(|e| TransportError::Config(format!("http client build failed: {e}")))
    }

    fn stdio_command(&self) -> Result<tokio::process::Command, TransportError> {
        let program = self.config.command.as_deref().ok_or_else(|| {
            TransportError::Config(format!("server '{}' has no command", self.config.name))
        })?;
        // Login shell so the child sees the user's PATH; see env module.
        let (shell, shell_args) = env::login_shell_invocation(program, &self.config.args);
        let mut command = tokio::process::Command::new(shell);
        command
            .args(shell_args)
            .env_clear()
            .envs(env::filtered_environment(&self.config.env));
        Ok(command)
    }
}

#[async_trait]
impl Transport for RmcpTransport {
    async fn start(&mut self) -> Result<UpstreamInfo, TransportError> {
        if self.service.is_some() {
            return Err(TransportError::Other("transport already started".to_string()));
        }

        let handler = HerdClientHandler {
            hook: self.hook.clone(),
        };
        let protocol = self.config.protocol.resolve(&self.config);
        let service = match protocol {
            Protocol::Stdio => {
                let command = self.stdio_command()?;
                let transport = TokioChildProcess::new(command)
                    .map_err(|e| TransportError::Broken(format!("failed to spawn: {e}")))?;
                handler
                    .serve(transport)
                    .await
                    .map_err(|e| classify_message(format!("failed to connect: {e}")))?
            }
            Protocol::Sse => {
                let client = self.build_http_client()?;
                let transport = SseClientTransport::start_with_client(
                    client,
                    SseClientConfig {
                        sse_endpoint: self.config.url.clone().into(),
                        ..Default::default()
                    },
                )
                .await
                .map_err(|e| classify_message(format!("sse connect failed: {e}")))?;
                handler
                    .serve(transport)
                    .await
                    .map_err(|e| classify_message(format!("failed to connect: {e}")))?
            }
            // Auto resolves before this point; plain HTTP rides the
            // streamable client.
            Protocol::Auto | Protocol::Http | Protocol::StreamableHttp => {
                let client = self.build_http_client()?;
                let transport = StreamableHttpClientTransport::with_client(
                    client,
                    StreamableHttpClientTransportConfig::with_uri(self.config.url.clone()),
                );
                handler
                    .serve(transport)
                    .await
                    .map_err(|e| classify_message(format!("failed to connect: {e}")))?
            }
        };

        let upstream = match service.peer_info() {
            Some(peer) => UpstreamInfo {
                name: peer.server_info.name.to_string(),
                version: peer.server_info.version.to_string(),
                supports_tools: peer.capabilities.tools.is_some(),
            },
            None => UpstreamInfo::default(),
        };
        info!(
            server = %self.config.name,
            upstream = %upstream.name,
            version = %upstream.version,
            "mcp session established"
        );

        self.service = Some(service);
        Ok(upstream)
    }

    async fn close(&mut self) {
        if let Some(service) = self.service.take() {
            service.cancellation_token().cancel();
        }
    }

    async fn list_tools(&self) -> Result<Vec<ToolDef>, TransportError> {
        let service = self.service()?;
        let result = service
            .list_tools(Default::default())
            .await
            .map_err(|e| classify_message(format!("tools/list failed: {e}")))?;
        Ok(result
            .tools
            .into_iter()
            .map(|tool| ToolDef {
                name: tool.name.to_string(),
                description: tool.description.map(|d| d.to_string()),
                input_schema: serde_json::Value::Object((*tool.input_schema).clone()),
            })
            .collect())
    }

    async fn call_tool(
        &self,
        name: &str,
        args: serde_json::Value,
    ) -> Result<ToolOutcome, TransportError> {
        let service = self.service()?;
        let result = service
            .call_tool(CallToolRequestParam {
                name: name.to_string().into(),
                arguments: args.as_object().cloned(),
            })
            .await
            .map_err(|e| classify_message(format!("tools/call failed: {e}")))?;

        let content = result
            .content
            .iter()
            .filter_map(|c| c.as_text().map(|t| t.text.to_string()))
            .collect::<Vec<_>>()
            .join("\n");

        Ok(ToolOutcome {
            content,
            is_error: result.is_error.unwrap_or(false),
        })
    }

    fn set_notification_hook(&mut self, hook: NotificationHook) {
        self.hook = Some(hook);
    }
}

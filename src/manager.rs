//! Public façade over the supervisor.
//!
//! Hosts talk to the fleet through this surface: add and remove servers,
//! discover tools across every upstream, invoke one by qualified name, and
//! subscribe to lifecycle events. Errors coming back from upstreams are
//! wrapped with a hint when the class is recognizable.

use crate::client::{split_qualified_name, ToolMetadata};
use crate::config::{ConfigSnapshot, ServerConfig};
use crate::events::{EventBus, EventReceiver};
use crate::snapshot::ServerStateSnapshot;
use crate::state::{ConnectionInfo, ConnectionState};
use crate::store::TokenStore;
use crate::supervisor::Supervisor;
use crate::transport::{ToolOutcome, TransportFactory};
use anyhow::{anyhow, bail, Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Status row for one server, for listing surfaces.
#[derive(Debug, Clone)]
pub struct ServerStatus {
    pub name: String,
    pub url: String,
    pub state: &'static str,
    pub tool_count: usize,
    pub last_error: Option<String>,
    pub retry_count: u32,
}

pub struct Manager {
    supervisor: Supervisor,
    store: Arc<TokenStore>,
}

impl Manager {
    pub fn new(store: Arc<TokenStore>, factory: Arc<dyn TransportFactory>) -> Self {
        let bus = Arc::new(EventBus::new());
        let supervisor = Supervisor::new(store.clone(), factory, bus);
        Self { supervisor, store }
    }

    /// Start the supervisor against a stream of config snapshots.
    pub fn start(&self, config_rx: mpsc::Receiver<ConfigSnapshot>) -> tokio::task::JoinHandle<()> {
        self.supervisor.spawn(config_rx)
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Register one server and reconcile it in.
    pub async fn add_server(&self, config: ServerConfig) -> Result<()> {
        self.supervisor
            .add_server(config)
            .await
            .map_err(|e| anyhow!(e))
    }

    /// Drop one server: actor stopped, connection closed, state forgotten.
    pub async fn remove_server(&self, name: &str) {
        self.supervisor.remove_server(name).await;
    }

    /// Kick a connect on every known server; failures are logged, not
    /// returned.
    pub async fn connect_all(&self) {
        for (name, client) in self.supervisor.clients().await {
            tokio::spawn(async move {
                if let Err(err) = client.connect().await {
                    warn!(server = %name, "connect failed: {err}");
                }
            });
        }
    }

    /// Cancel the whole fleet; every actor observes it and exits.
    pub async fn disconnect_all(&self) {
        self.supervisor.shutdown().await;
    }

    /// Aggregate tool metadata across all Ready servers.
    ///
    /// A server that fails to list contributes nothing; discovery never
    /// fails as a whole.
    pub async fn discover_tools(&self) -> Vec<ToolMetadata> {
        let clients = self.supervisor.clients().await;
        let mut jobs = Vec::new();
        for (name, client) in clients {
            if client.core().state().state() != ConnectionState::Ready {
                continue;
            }
            jobs.push(async move { (name, client.list_tools().await) });
        }

        let mut tools = Vec::new();
        for (name, result) in futures::future::join_all(jobs).await {
            match result {
                Ok(server_tools) => tools.extend(server_tools),
                Err(err) => warn!(server = %name, "tool discovery failed: {err}"),
            }
        }
        tools.sort_by(|a, b| a.qualified_name.cmp(&b.qualified_name));
        tools
    }

    /// Invoke `"<server>:<tool>"` with the given arguments.
    pub async fn call_tool(&self, qualified: &str, args: serde_json::Value) -> Result<ToolOutcome> {
        let (server, tool) = split_qualified_name(qualified).ok_or_else(|| {
            anyhow!("invalid tool name format: '{qualified}' (expected \"server:tool\")")
        })?;

        let client = self
            .supervisor
            .client_for(server)
            .await
            .ok_or_else(|| anyhow!("unknown server '{server}'"))?;

        let config = client.core().config();
        if config.quarantined {
            bail!("server '{server}' is quarantined; unquarantine it before calling tools");
        }
        if !config.enabled {
            bail!("server '{server}' is disabled");
        }

        let state = client.core().state().state();
        if state != ConnectionState::Ready {
            bail!(not_connected_message(server, state, &client.core().state().info()));
        }

        client
            .call_tool(tool, args)
            .await
            .map_err(|err| wrap_tool_error(qualified, &err.to_string()))
    }

    /// Idempotent reconnect trigger for one server.
    pub async fn retry_connection(&self, name: &str) -> Result<()> {
        self.supervisor
            .retry_connection(name)
            .await
            .map_err(|e| anyhow!(e))
    }

    /// Forget stored credentials for one server and drop its connection.
    pub async fn logout(&self, name: &str) -> Result<()> {
        let client = self
            .supervisor
            .client_for(name)
            .await
            .ok_or_else(|| anyhow!("unknown server '{name}'"))?;
        let config = client.core().config();
        self.store
            .clear(&config.name, &config.url)
            .context("failed to clear stored token")?;
        client.disconnect().await;
        info!(server = %name, "logged out");
        Ok(())
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.supervisor.bus().subscribe()
    }

    pub fn current_snapshot(&self) -> Arc<ServerStateSnapshot> {
        self.supervisor.current_snapshot()
    }

    /// Per-server status rows, sorted by name.
    pub async fn list_servers(&self) -> Vec<ServerStatus> {
        let mut rows: Vec<ServerStatus> = self
            .supervisor
            .clients()
            .await
            .into_iter()
            .map(|(name, client)| {
                let config = client.core().config();
                let info = client.core().state().info();
                ServerStatus {
                    name,
                    url: config.url.clone(),
                    state: info.state.as_str(),
                    tool_count: client.core().tool_count(),
                    last_error: info.last_error,
                    retry_count: info.retry_count,
                }
            })
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }
}

fn not_connected_message(server: &str, state: ConnectionState, info: &ConnectionInfo) -> String {
    match state {
        ConnectionState::Connecting
        | ConnectionState::Authenticating
        | ConnectionState::Discovering => {
            format!("server '{server}' is still connecting ({}); try again shortly", state.as_str())
        }
        _ => match &info.last_error {
            Some(error) => {
                format!("server '{server}' is not connected (last error: {error})")
            }
            None => format!("server '{server}' is not connected"),
        },
    }
}

/// Attach a hint for recognizable upstream error classes.
fn wrap_tool_error(qualified: &str, message: &str) -> anyhow::Error {
    let lower = message.to_lowercase();
    let hint = if lower.contains("insufficient_scope") || lower.contains("access_denied") {
        Some("the granted OAuth scopes do not cover this tool")
    } else if lower.contains("unauthorized")
        || lower.contains("401")
        || lower.contains("authorization required")
        || lower.contains("no valid token available")
    {
        Some("authentication required; complete the OAuth flow for this server")
    } else if lower.contains("429") || lower.contains("rate limit") {
        Some("the upstream is rate limiting requests; retry later")
    } else if lower.contains("tool not found") || lower.contains("unknown tool") {
        Some("tool not found on this server; refresh tool discovery")
    } else {
        None
    };

    match hint {
        Some(hint) => anyhow!("tool call '{qualified}' failed: {message} ({hint})"),
        None => anyhow!("tool call '{qualified}' failed: {message}"),
    }
}

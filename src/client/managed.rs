//! Managed client: core client plus reconnect policy.
//!
//! A background probe watches each connection: errored sessions reconnect
//! once their backoff has elapsed, Ready sessions get a lightweight
//! liveness check so silent transport deaths surface within a probe cycle.

use super::core::CoreClient;
use super::ClientError;
use crate::config::ServerConfig;
use crate::state::ConnectionState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const HEALTH_INTERVAL: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const RECONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const LIST_TIMEOUT: Duration = Duration::from_secs(30);

/// Error strings that mean "the connection is gone", for upstreams that
/// only speak in prose.
const CONNECTION_ERROR_MARKERS: &[&str] = &[
    "connection refused",
    "no such host",
    "connection reset",
    "broken pipe",
    "network is unreachable",
    "timeout",
    "deadline exceeded",
    "context canceled",
];

/// True when `message` describes a transport-level failure.
pub fn is_connection_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    CONNECTION_ERROR_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
}

pub struct ManagedClient {
    core: CoreClient,
    /// At most one managed `tools/list` in flight per server.
    list_gate: Mutex<()>,
}

impl ManagedClient {
    pub fn new(core: CoreClient) -> Self {
        Self {
            core,
            list_gate: Mutex::new(()),
        }
    }

    pub fn core(&self) -> &CoreClient {
        &self.core
    }

    pub fn set_config(&self, config: Arc<ServerConfig>) {
        self.core.set_config(config);
    }

    pub async fn connect(&self) -> Result<(), ClientError> {
        self.core.connect().await
    }

    pub async fn disconnect(&self) {
        self.core.disconnect().await;
    }

    pub async fn list_tools(&self) -> Result<Vec<super::ToolMetadata>, ClientError> {
        let _gate = self.list_gate.lock().await;
        match tokio::time::timeout(LIST_TIMEOUT, self.core.list_tools()).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Other(format!(
                "tools/list timed out after {LIST_TIMEOUT:?}"
            ))),
        }
    }

    pub async fn call_tool(
        &self,
        tool: &str,
        args: serde_json::Value,
    ) -> Result<crate::transport::ToolOutcome, ClientError> {
        self.core.call_tool(tool, args).await
    }

    /// Tear down whatever is left of the session and connect from scratch.
    pub async fn try_reconnect(&self) -> Result<(), ClientError> {
        let config = self.core.config();
        info!(server = %config.name, "reconnecting");
        self.core.force_close().await;
        self.core.state().reset();

        match tokio::time::timeout(RECONNECT_TIMEOUT, self.core.connect()).await {
            Ok(result) => result,
            Err(_) => {
                let message = format!("reconnect timed out after {RECONNECT_TIMEOUT:?}");
                self.core.state().set_error(message.clone());
                Err(ClientError::Other(message))
            }
        }
    }

    /// One probe pass: reconnect errored sessions whose backoff elapsed,
    /// liveness-check Ready ones.
    async fn probe_once(&self) {
        let state = self.core.state().state();
        match state {
            ConnectionState::Error => {
                if self.core.state().should_retry() {
                    if let Err(err) = self.try_reconnect().await {
                        debug!(error = %err, "probe reconnect failed");
                    }
                }
            }
            ConnectionState::Ready => {
                let result = tokio::time::timeout(PROBE_TIMEOUT, self.core.probe()).await;
                let failure = match result {
                    Ok(Ok(_)) => None,
                    Ok(Err(err)) => {
                        let message = err.to_string();
                        is_connection_error(&message).then_some(message)
                    }
                    Err(_) => Some(format!("health probe timeout after {PROBE_TIMEOUT:?}")),
                };
                if let Some(message) = failure {
                    warn!(message = %message, "health probe failed, marking connection broken");
                    self.core.state().set_error(message);
                }
            }
            _ => {}
        }
    }

    /// Run the 30-second health probe until cancelled.
    pub fn spawn_health_probe(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEALTH_INTERVAL);
            // The immediate first tick would race startup; skip it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => client.probe_once().await,
                }
            }
        })
    }
}

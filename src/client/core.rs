//! Core per-server client: one transport, one MCP session.
//!
//! Connect performs the token/transport/initialize dance and hands off to
//! the OAuth engine exactly once when the upstream demands authorization.
//! `tools/list` sits behind a short result cache and a circuit breaker;
//! both `connect` and `tools/list` are single-flighted so stampedes
//! collapse into one upstream call.

use super::{tool_metadata, ClientError, ToolMetadata};
use crate::config::ServerConfig;
use crate::events::{Event, EventBus, EventKind};
use crate::flight::SingleFlight;
use crate::oauth::OAuthEngine;
use crate::state::{ConnectionState, StateManager};
use crate::store::{now_ms, TokenRecord, TokenStore};
use crate::transport::{
    Transport, TransportError, TransportFactory, TransportNotification, TransportOptions,
    UpstreamInfo,
};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// How long a `tools/list` result suppresses repeat upstream calls.
const TOOLS_CACHE_TTL: Duration = Duration::from_secs(30);
/// Consecutive `tools/list` failures before the breaker opens.
const BREAKER_THRESHOLD: u32 = 3;
const BREAKER_MAX_OPEN: Duration = Duration::from_secs(600);

/// Trips after repeated list failures so a flapping upstream is not
/// hammered every 30 seconds.
#[derive(Debug, Default)]
struct CircuitBreaker {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures >= BREAKER_THRESHOLD {
            self.opened_at = Some(Instant::now());
        }
    }

    fn record_success(&mut self) {
        *self = CircuitBreaker::default();
    }

    /// Open window for the current failure count: `min(2^(f-3) min, 10 min)`.
    fn open_duration(&self) -> Duration {
        let exponent = self
            .consecutive_failures
            .saturating_sub(BREAKER_THRESHOLD)
            .min(10);
        Duration::from_secs(60u64 << exponent).min(BREAKER_MAX_OPEN)
    }

    /// `Some(failures)` while the breaker holds requests off.
    fn open(&self) -> Option<u32> {
        let opened_at = self.opened_at?;
        if self.consecutive_failures >= BREAKER_THRESHOLD
            && opened_at.elapsed() < self.open_duration()
        {
            Some(self.consecutive_failures)
        } else {
            None
        }
    }
}

struct CoreInner {
    state: Arc<StateManager>,
    store: Arc<TokenStore>,
    factory: Arc<dyn TransportFactory>,
    bus: Arc<EventBus>,
    config: StdRwLock<Arc<ServerConfig>>,
    oauth: StdRwLock<Arc<OAuthEngine>>,
    transport: RwLock<Option<Box<dyn Transport>>>,
    upstream: StdRwLock<Option<UpstreamInfo>>,
    tools_cache: StdMutex<Option<(Instant, Vec<ToolMetadata>)>>,
    breaker: StdMutex<CircuitBreaker>,
    connect_flight: SingleFlight<u8, Result<(), ClientError>>,
    list_flight: SingleFlight<u8, Result<Vec<ToolMetadata>, ClientError>>,
    /// Unix ms of the last successful upstream interaction.
    last_seen_ms: AtomicI64,
}

/// Cheap-to-clone handle to one server's session.
#[derive(Clone)]
pub struct CoreClient {
    inner: Arc<CoreInner>,
}

impl CoreClient {
    pub fn new(
        config: Arc<ServerConfig>,
        state: Arc<StateManager>,
        store: Arc<TokenStore>,
        factory: Arc<dyn TransportFactory>,
        bus: Arc<EventBus>,
    ) -> Self {
        let oauth = Arc::new(OAuthEngine::new(
            config.name.clone(),
            config.url.clone(),
            config.oauth.as_ref(),
            store.clone(),
        ));
        Self {
            inner: Arc::new(CoreInner {
                state,
                store,
                factory,
                bus,
                config: StdRwLock::new(config),
                oauth: StdRwLock::new(oauth),
                transport: RwLock::new(None),
                upstream: StdRwLock::new(None),
                tools_cache: StdMutex::new(None),
                breaker: StdMutex::new(CircuitBreaker::default()),
                connect_flight: SingleFlight::new(),
                list_flight: SingleFlight::new(),
                last_seen_ms: AtomicI64::new(0),
            }),
        }
    }

    pub fn config(&self) -> Arc<ServerConfig> {
        self.inner
            .config
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Atomically swap the config; in-flight callers finish against the
    /// previous value.
    pub fn set_config(&self, config: Arc<ServerConfig>) {
        let oauth = Arc::new(OAuthEngine::new(
            config.name.clone(),
            config.url.clone(),
            config.oauth.as_ref(),
            self.inner.store.clone(),
        ));
        *self
            .inner
            .config
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = config;
        *self
            .inner
            .oauth
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = oauth;
        self.clear_tools_cache();
    }

    pub fn state(&self) -> &Arc<StateManager> {
        &self.inner.state
    }

    pub fn upstream_info(&self) -> Option<UpstreamInfo> {
        self.inner
            .upstream
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Tools seen in the last listing, fresh or not. Snapshot fodder.
    pub fn tool_count(&self) -> usize {
        self.inner
            .tools_cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .map(|(_, tools)| tools.len())
            .unwrap_or(0)
    }

    /// Unix ms of the last successful upstream interaction, 0 if never.
    pub fn last_seen_ms(&self) -> i64 {
        self.inner.last_seen_ms.load(Ordering::Relaxed)
    }

    fn oauth_engine(&self) -> Arc<OAuthEngine> {
        self.inner
            .oauth
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn clear_tools_cache(&self) {
        self.inner
            .tools_cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
    }

    fn mark_seen(&self) {
        self.inner.last_seen_ms.store(now_ms(), Ordering::Relaxed);
    }

    fn publish(&self, kind: EventKind, error: Option<String>) {
        let config = self.config();
        let mut event = Event::new(kind, config.name.clone());
        if let Some(error) = error {
            event = event.with_error(error);
        }
        self.inner.bus.publish(event);
    }

    fn load_token(&self, config: &ServerConfig) -> Option<TokenRecord> {
        match self.inner.store.load(&config.name, &config.url) {
            Ok(record) => record,
            Err(err) => {
                warn!(server = %config.name, "token load failed: {err}");
                None
            }
        }
    }

    /// Establish the session. Idempotent: concurrent callers join one
    /// attempt, and a Ready client returns immediately.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let client = self.clone();
        self.inner
            .connect_flight
            .run(0, move || async move { client.connect_inner().await })
            .await
    }

    async fn connect_inner(&self) -> Result<(), ClientError> {
        if self.inner.state.state() == ConnectionState::Ready {
            return Ok(());
        }
        self.inner.state.transition_to(ConnectionState::Connecting);
        let config = self.config();

        // Stored credentials, refreshed when close to expiry.
        let mut token = self.load_token(&config);
        if let Some(record) = &token {
            match self.oauth_engine().refresh_if_needed(record).await {
                Ok(Some(fresh)) => token = Some(fresh),
                Ok(None) => {}
                Err(err) => {
                    // The old token may still be honored; let the server say.
                    warn!(server = %config.name, "token refresh failed: {err}");
                }
            }
        }

        // Eager authorization: an OAuth-configured server without lazy_auth
        // authenticates up front when no token is stored.
        if token.is_none() && config.oauth.as_ref().is_some_and(|o| !o.lazy_auth) {
            token = Some(self.run_oauth_flow("no stored token").await?);
        }

        let info = match self.try_start(&config, token.as_ref()).await {
            Ok(info) => info,
            Err(err) if auth_required(&config, token.as_ref(), &err) => {
                let fresh = self.run_oauth_flow(&err.to_string()).await?;
                // Exactly one retry with the fresh credentials.
                match self.try_start(&config, Some(&fresh)).await {
                    Ok(info) => info,
                    Err(err) => {
                        self.inner.state.set_error(err.to_string());
                        return Err(err.into());
                    }
                }
            }
            Err(err) => {
                self.inner.state.set_error(err.to_string());
                return Err(err.into());
            }
        };

        self.inner.state.transition_to(ConnectionState::Discovering);
        self.inner
            .state
            .set_server_info(info.name.clone(), info.version.clone());
        self.inner.state.transition_to(ConnectionState::Ready);
        self.mark_seen();
        info!(server = %config.name, upstream = %info.name, "connected");
        Ok(())
    }

    /// Run the interactive OAuth flow, emitting the Required/Completed
    /// event pair around it.
    async fn run_oauth_flow(&self, reason: &str) -> Result<TokenRecord, ClientError> {
        self.inner
            .state
            .transition_to(ConnectionState::Authenticating);
        self.publish(EventKind::OAuthRequired, Some(reason.to_string()));

        match self.oauth_engine().authorize().await {
            Ok(record) => {
                self.publish(EventKind::OAuthCompleted, None);
                self.inner.state.transition_to(ConnectionState::Connecting);
                Ok(record)
            }
            Err(err) => {
                self.inner.state.set_error(err.to_string());
                Err(err.into())
            }
        }
    }

    /// Build the transport, start it under the connect timeout, and stash
    /// the live session.
    async fn try_start(
        &self,
        config: &ServerConfig,
        token: Option<&TokenRecord>,
    ) -> Result<UpstreamInfo, TransportError> {
        let options = TransportOptions {
            headers: Default::default(),
            auth_token: token.map(|t| t.access_token.clone()),
        };
        let mut transport = self.inner.factory.build(config, options)?;

        let weak = Arc::downgrade(&self.inner);
        transport.set_notification_hook(Arc::new(move |notification| {
            if notification == TransportNotification::ToolListChanged {
                if let Some(inner) = weak.upgrade() {
                    debug!("tool list changed upstream, dropping cache");
                    inner
                        .tools_cache
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .take();
                }
            }
        }));

        let connect_timeout = config.timeout().unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        let info = match tokio::time::timeout(connect_timeout, transport.start()).await {
            Ok(result) => result?,
            Err(_) => {
                transport.close().await;
                return Err(TransportError::Broken(format!(
                    "connect timed out after {connect_timeout:?}"
                )));
            }
        };

        *self
            .inner
            .upstream
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(info.clone());
        *self.inner.transport.write().await = Some(transport);
        Ok(info)
    }

    /// Close the transport without touching connection state.
    pub async fn force_close(&self) {
        if let Some(mut transport) = self.inner.transport.write().await.take() {
            transport.close().await;
        }
    }

    /// Close the session and record the disconnect.
    pub async fn disconnect(&self) {
        self.force_close().await;
        self.inner
            .state
            .transition_to(ConnectionState::Disconnected);
    }

    /// Refresh stored credentials before an authenticated request. When a
    /// refresh actually happened the open transport carries a stale
    /// Authorization header, so it is torn down and rebuilt.
    async fn refresh_credentials(&self) -> Result<(), ClientError> {
        let config = self.config();
        let Some(record) = self.load_token(&config) else {
            return Ok(());
        };
        match self.oauth_engine().refresh_if_needed(&record).await {
            Ok(Some(_)) => {
                self.force_close().await;
                self.inner
                    .state
                    .transition_to(ConnectionState::Disconnected);
                self.connect().await
            }
            Ok(None) => Ok(()),
            Err(err) => {
                // Best effort: the request will surface auth errors itself.
                warn!(server = %config.name, "token refresh failed: {err}");
                Ok(())
            }
        }
    }

    fn breaker_open(&self) -> Option<u32> {
        self.inner
            .breaker
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .open()
    }

    fn cached_tools(&self) -> Option<Vec<ToolMetadata>> {
        let cache = self
            .inner
            .tools_cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match cache.as_ref() {
            Some((at, tools)) if at.elapsed() < TOOLS_CACHE_TTL => Some(tools.clone()),
            _ => None,
        }
    }

    /// List this server's tools as fleet metadata.
    pub async fn list_tools(&self) -> Result<Vec<ToolMetadata>, ClientError> {
        if let Some(tools) = self.cached_tools() {
            return Ok(tools);
        }
        if let Some(failures) = self.breaker_open() {
            return Err(ClientError::CircuitOpen { failures });
        }
        let client = self.clone();
        self.inner
            .list_flight
            .run(0, move || async move { client.list_tools_inner().await })
            .await
    }

    async fn list_tools_inner(&self) -> Result<Vec<ToolMetadata>, ClientError> {
        self.refresh_credentials().await?;

        let config = self.config();
        if let Some(info) = self.upstream_info() {
            if !info.supports_tools {
                return Ok(Vec::new());
            }
        }

        let guard = self.inner.transport.read().await;
        let Some(transport) = guard.as_ref() else {
            return Err(ClientError::NotConnected(format!(
                "server '{}' has no live session",
                config.name
            )));
        };

        match transport.list_tools().await {
            Ok(defs) => {
                drop(guard);
                let tools: Vec<ToolMetadata> = defs
                    .iter()
                    .map(|def| tool_metadata(&config.name, def))
                    .collect();
                *self
                    .inner
                    .tools_cache
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner) =
                    Some((Instant::now(), tools.clone()));
                self.inner
                    .breaker
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .record_success();
                self.mark_seen();
                Ok(tools)
            }
            Err(err) => {
                drop(guard);
                self.inner
                    .breaker
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .record_failure();
                if err.is_broken() {
                    self.inner.state.set_error(err.to_string());
                }
                Err(err.into())
            }
        }
    }

    /// Invoke one tool on this server.
    pub async fn call_tool(
        &self,
        tool: &str,
        args: serde_json::Value,
    ) -> Result<crate::transport::ToolOutcome, ClientError> {
        self.refresh_credentials().await?;
        let config = self.config();

        let guard = self.inner.transport.read().await;
        let Some(transport) = guard.as_ref() else {
            return Err(ClientError::NotConnected(format!(
                "server '{}' has no live session",
                config.name
            )));
        };

        let result = match config.timeout() {
            Some(limit) => match tokio::time::timeout(limit, transport.call_tool(tool, args)).await
            {
                Ok(result) => result,
                Err(_) => Err(TransportError::Other(format!(
                    "tools/call timed out after {limit:?}"
                ))),
            },
            None => transport.call_tool(tool, args).await,
        };
        drop(guard);

        match result {
            Ok(outcome) => {
                self.mark_seen();
                Ok(outcome)
            }
            Err(err) => {
                // Broken pipes and friends mean the session is toast; say
                // so before surfacing the error.
                if err.is_broken() {
                    self.inner.state.set_error(err.to_string());
                }
                Err(err.into())
            }
        }
    }

    /// Direct `tools/list` with no cache, no breaker. Liveness probes use
    /// this so a cached result cannot mask a dead session.
    pub async fn probe(&self) -> Result<usize, ClientError> {
        let guard = self.inner.transport.read().await;
        let Some(transport) = guard.as_ref() else {
            return Err(ClientError::NotConnected("no live session".to_string()));
        };
        let defs = transport.list_tools().await?;
        drop(guard);
        self.mark_seen();
        Ok(defs.len())
    }

    #[cfg(test)]
    pub(crate) fn backdate_breaker(&self, by: Duration) {
        let mut breaker = self
            .inner
            .breaker
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(opened) = breaker.opened_at {
            breaker.opened_at = Some(opened.checked_sub(by).unwrap_or(opened));
        }
    }

    #[cfg(test)]
    pub(crate) fn expire_tools_cache(&self) {
        let mut cache = self
            .inner
            .tools_cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some((at, _)) = cache.as_mut() {
            *at = Instant::now() - TOOLS_CACHE_TTL - Duration::from_secs(1);
        }
    }
}

/// Does this connect failure mean "go authenticate"?
///
/// Structured/substring unauthorized always does; a connect timeout counts
/// only when the server is known to want OAuth and we hold no token.
fn auth_required(config: &ServerConfig, token: Option<&TokenRecord>, err: &TransportError) -> bool {
    if err.is_unauthorized() {
        return true;
    }
    config.oauth.is_some() && token.is_none() && err.to_string().contains("timed out")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{tool_def, upstream, Script, ScriptedFactory};

    fn harness(config: ServerConfig) -> (CoreClient, Arc<Script>, Arc<TokenStore>) {
        let script = Script::new();
        let store = Arc::new(TokenStore::in_memory().unwrap());
        let state = Arc::new(StateManager::new(config.name.clone()));
        let bus = Arc::new(EventBus::new());
        let client = CoreClient::new(
            Arc::new(config),
            state,
            store.clone(),
            Arc::new(ScriptedFactory::new(script.clone())),
            bus,
        );
        (client, script, store)
    }

    fn config(name: &str) -> ServerConfig {
        ServerConfig::http(name, "https://upstream.example/mcp")
    }

    #[tokio::test]
    async fn test_connect_happy_path() {
        let (client, script, _) = harness(config("s1"));
        script.push_start(Ok(upstream("S1")));

        client.connect().await.unwrap();

        assert_eq!(client.state().state(), ConnectionState::Ready);
        let info = client.state().info();
        assert_eq!(info.server_name.as_deref(), Some("S1"));
        assert_eq!(info.server_version.as_deref(), Some("1.0"));
        assert_eq!(info.retry_count, 0);
        assert_eq!(script.starts(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_sets_error() {
        let (client, script, _) = harness(config("s1"));
        script.push_start(Err(TransportError::Broken("connection refused".into())));

        let err = client.connect().await.unwrap_err();
        assert!(err.is_connection_failure());

        let info = client.state().info();
        assert_eq!(info.state, ConnectionState::Error);
        assert_eq!(info.retry_count, 1);
        assert!(info.last_error.as_deref().unwrap().contains("refused"));
    }

    #[tokio::test]
    async fn test_connect_is_idempotent_when_ready() {
        let (client, script, _) = harness(config("s1"));
        client.connect().await.unwrap();
        client.connect().await.unwrap();
        assert_eq!(script.starts(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_connects_share_one_start() {
        let (client, script, _) = harness(config("s1"));
        let mut handles = Vec::new();
        for _ in 0..5 {
            let client = client.clone();
            handles.push(tokio::spawn(async move { client.connect().await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(script.starts(), 1);
    }

    #[tokio::test]
    async fn test_stored_token_rides_the_transport() {
        let (client, script, store) = harness(config("s1"));
        store
            .save("s1", "https://upstream.example/mcp", &TokenRecord::new("tok-abc"))
            .unwrap();

        client.connect().await.unwrap();

        let tokens = script.seen_tokens.lock().unwrap();
        assert_eq!(tokens.as_slice(), &[Some("tok-abc".to_string())]);
    }

    #[tokio::test]
    async fn test_list_tools_is_cached() {
        let (client, script, _) = harness(config("s1"));
        script.set_default_tools(vec![tool_def("echo"), tool_def("add")]);
        client.connect().await.unwrap();

        let first = client.list_tools().await.unwrap();
        let second = client.list_tools().await.unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
        assert_eq!(script.lists(), 1);
        assert_eq!(first[0].qualified_name, "s1:echo");
        assert_eq!(client.tool_count(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_list_tools_share_one_upstream_call() {
        let (client, script, _) = harness(config("s1"));
        script.set_default_tools(vec![tool_def("echo")]);
        client.connect().await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..5 {
            let client = client.clone();
            handles.push(tokio::spawn(async move { client.list_tools().await }));
        }
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(script.lists(), 1);
        // Every caller observed the same listing.
        for result in &results {
            assert_eq!(result, &results[0]);
        }
    }

    #[tokio::test]
    async fn test_expired_cache_refetches() {
        let (client, script, _) = harness(config("s1"));
        script.set_default_tools(vec![tool_def("echo")]);
        client.connect().await.unwrap();

        client.list_tools().await.unwrap();
        client.expire_tools_cache();
        client.list_tools().await.unwrap();
        assert_eq!(script.lists(), 2);
    }

    #[tokio::test]
    async fn test_capability_gate_returns_empty() {
        let (client, script, _) = harness(config("s1"));
        let mut info = upstream("S1");
        info.supports_tools = false;
        script.push_start(Ok(info));
        client.connect().await.unwrap();

        let tools = client.list_tools().await.unwrap();
        assert!(tools.is_empty());
        assert_eq!(script.lists(), 0);
    }

    #[tokio::test]
    async fn test_circuit_breaker_opens_after_three_failures() {
        let (client, script, _) = harness(config("s1"));
        client.connect().await.unwrap();
        for _ in 0..3 {
            script.push_list(Err(TransportError::Other("schema exploded".into())));
        }

        for _ in 0..3 {
            assert!(client.list_tools().await.is_err());
        }
        assert_eq!(script.lists(), 3);

        // Fourth call never reaches the transport.
        let err = client.list_tools().await.unwrap_err();
        assert!(matches!(err, ClientError::CircuitOpen { failures: 3 }));
        assert_eq!(script.lists(), 3);
    }

    #[tokio::test]
    async fn test_circuit_breaker_half_opens_after_window() {
        let (client, script, _) = harness(config("s1"));
        script.set_default_tools(vec![tool_def("echo")]);
        client.connect().await.unwrap();
        for _ in 0..3 {
            script.push_list(Err(TransportError::Other("boom".into())));
            let _ = client.list_tools().await;
        }
        assert!(matches!(
            client.list_tools().await,
            Err(ClientError::CircuitOpen { .. })
        ));

        // After the open window a fresh attempt goes through and resets.
        client.backdate_breaker(Duration::from_secs(61));
        let tools = client.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert!(client.breaker_open().is_none());
    }

    #[test]
    fn test_breaker_window_schedule() {
        let mut breaker = CircuitBreaker::default();
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(breaker.open_duration(), Duration::from_secs(60));
        breaker.record_failure();
        assert_eq!(breaker.open_duration(), Duration::from_secs(120));
        breaker.record_failure();
        assert_eq!(breaker.open_duration(), Duration::from_secs(240));
        for _ in 0..10 {
            breaker.record_failure();
        }
        // Capped at ten minutes.
        assert_eq!(breaker.open_duration(), BREAKER_MAX_OPEN);

        breaker.record_success();
        assert!(breaker.open().is_none());
        assert_eq!(breaker.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_call_tool_broken_marks_connection() {
        let (client, script, _) = harness(config("s1"));
        client.connect().await.unwrap();
        script.push_call(Err(TransportError::Broken("broken pipe".into())));

        let err = client.call_tool("echo", serde_json::json!({})).await.unwrap_err();
        assert!(err.is_connection_failure());
        assert_eq!(client.state().state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn test_call_tool_upstream_error_keeps_ready() {
        let (client, script, _) = harness(config("s1"));
        client.connect().await.unwrap();
        script.push_call(Err(TransportError::Other("429 too many requests".into())));

        let err = client.call_tool("echo", serde_json::json!({})).await.unwrap_err();
        assert!(!err.is_connection_failure());
        // Rate limits are the upstream's mood, not a dead connection.
        assert_eq!(client.state().state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_call_tool_success() {
        let (client, _, _) = harness(config("s1"));
        client.connect().await.unwrap();

        let outcome = client
            .call_tool("echo", serde_json::json!({"message": "hi"}))
            .await
            .unwrap();
        assert!(!outcome.is_error);
        assert!(outcome.content.contains("echo"));
        assert!(client.last_seen_ms() > 0);
    }

    #[tokio::test]
    async fn test_disconnect() {
        let (client, script, _) = harness(config("s1"));
        client.connect().await.unwrap();
        client.disconnect().await;

        assert_eq!(client.state().state(), ConnectionState::Disconnected);
        assert_eq!(script.closes.load(Ordering::SeqCst), 1);
        assert!(matches!(
            client.call_tool("echo", serde_json::json!({})).await,
            Err(ClientError::NotConnected(_))
        ));
    }

    #[test]
    fn test_auth_required_detection() {
        let plain = config("s1");
        let mut with_oauth = config("s1");
        with_oauth.oauth = Some(Default::default());

        let unauthorized = TransportError::Unauthorized("401".into());
        let timeout = TransportError::Broken("connect timed out after 30s".into());
        let refused = TransportError::Broken("connection refused".into());

        assert!(auth_required(&plain, None, &unauthorized));
        assert!(auth_required(&with_oauth, None, &timeout));
        // A timeout with a token in hand, or without an OAuth block, is
        // just a timeout.
        let token = TokenRecord::new("at");
        assert!(!auth_required(&with_oauth, Some(&token), &timeout));
        assert!(!auth_required(&plain, None, &timeout));
        assert!(!auth_required(&with_oauth, None, &refused));
    }

    #[tokio::test]
    async fn test_set_config_clears_cache() {
        let (client, script, _) = harness(config("s1"));
        script.set_default_tools(vec![tool_def("echo")]);
        client.connect().await.unwrap();
        client.list_tools().await.unwrap();
        assert_eq!(client.tool_count(), 1);

        client.set_config(Arc::new(config("s1")));
        assert_eq!(client.tool_count(), 0);
    }
}

//! Cluster supervisor: reconciles desired config against live actors.
//!
//! Config snapshots come in; a plan of connect/disconnect/reconnect/remove
//! actions goes out to per-server actors; a fresh fleet snapshot is
//! published after every pass. Two side channels watch the token store so
//! that an OAuth flow completed elsewhere (another process included) wakes
//! the affected server promptly.

pub mod actor;
pub mod backoff;
pub mod plan;

use crate::client::core::CoreClient;
use crate::client::managed::ManagedClient;
use crate::config::{ConfigSnapshot, ServerConfig};
use crate::events::{Event, EventBus, EventKind};
use crate::flight::SingleFlight;
use crate::snapshot::{ServerState, ServerStateSnapshot, SnapshotPublisher};
use crate::state::{ConnectionState, StateManager};
use crate::store::TokenStore;
use crate::transport::TransportFactory;
use actor::{ActorHandle, Command};
use chrono::DateTime;
use plan::{compute_plan, ObservedServer, PlannedAction, ReconcileAction};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Periodic drift-correction pass.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(30);
/// Budget for one plan action.
const ACTION_TIMEOUT: Duration = Duration::from_secs(30);
/// Poll interval for OAuth completions and the token scanner.
const TOKEN_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Minimum spacing between scanner-initiated retries per server.
const AUTO_RETRY_MIN_GAP: Duration = Duration::from_secs(10);
/// Completion events older than this are garbage.
const COMPLETION_RETENTION: Duration = Duration::from_secs(24 * 3600);

struct Inner {
    store: Arc<TokenStore>,
    factory: Arc<dyn TransportFactory>,
    bus: Arc<EventBus>,
    publisher: SnapshotPublisher,
    actors: RwLock<HashMap<String, ActorHandle>>,
    desired: StdRwLock<BTreeMap<String, Arc<ServerConfig>>>,
    cancel: CancellationToken,
    retry_flight: SingleFlight<String, Result<(), String>>,
    last_auto_retry: StdMutex<HashMap<String, Instant>>,
}

/// Cheap-to-clone supervisor handle.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(
        store: Arc<TokenStore>,
        factory: Arc<dyn TransportFactory>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                factory,
                bus,
                publisher: SnapshotPublisher::new(),
                actors: RwLock::new(HashMap::new()),
                desired: StdRwLock::new(BTreeMap::new()),
                cancel: CancellationToken::new(),
                retry_flight: SingleFlight::new(),
                last_auto_retry: StdMutex::new(HashMap::new()),
            }),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    /// Run the reconcile loop and the token monitor until shutdown.
    pub fn spawn(&self, config_rx: mpsc::Receiver<ConfigSnapshot>) -> tokio::task::JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move { monitor.token_monitor_loop().await });

        let supervisor = self.clone();
        tokio::spawn(async move { supervisor.run(config_rx).await })
    }

    async fn run(self, config_rx: mpsc::Receiver<ConfigSnapshot>) {
        let mut config_rx = Some(config_rx);
        let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                maybe = async {
                    match config_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match maybe {
                        Some(snapshot) => self.apply_snapshot(snapshot).await,
                        None => {
                            debug!("config stream closed, drift ticker only");
                            config_rx = None;
                        }
                    }
                }
                _ = ticker.tick() => self.reconcile().await,
            }
        }
    }

    /// Adopt a new desired snapshot and reconcile toward it.
    pub async fn apply_snapshot(&self, snapshot: ConfigSnapshot) {
        info!(
            version = snapshot.version,
            servers = snapshot.servers.len(),
            "applying config snapshot"
        );
        *self
            .inner
            .desired
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = snapshot.servers;
        self.reconcile().await;
    }

    fn desired(&self) -> BTreeMap<String, Arc<ServerConfig>> {
        self.inner
            .desired
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// One reconciliation pass: plan, execute, publish.
    ///
    /// A failed action is reported and skipped; the rest of the plan runs.
    pub async fn reconcile(&self) {
        let desired = self.desired();
        let observed = {
            let actors = self.inner.actors.read().await;
            actors
                .iter()
                .map(|(name, handle)| {
                    (
                        name.clone(),
                        ObservedServer {
                            config: handle.client().core().config(),
                            state: handle.client().core().state().state(),
                        },
                    )
                })
                .collect::<BTreeMap<_, _>>()
        };

        let planned = compute_plan(&desired, &observed);
        if !planned.is_empty() {
            debug!(actions = planned.len(), "executing reconcile plan");
        }

        for action in &planned {
            let result =
                match tokio::time::timeout(ACTION_TIMEOUT, self.execute(action, &desired)).await {
                    Ok(result) => result,
                    Err(_) => Err(format!("action timed out after {ACTION_TIMEOUT:?}")),
                };
            if let Err(error) = result {
                warn!(server = %action.server, action = ?action.action, "reconcile action failed: {error}");
                self.inner.bus.publish(
                    Event::new(EventKind::ReconciliationFailed, action.server.clone())
                        .with_error(error),
                );
            }
        }

        let version = self.publish_snapshot().await;
        self.inner.bus.publish(
            Event::new(EventKind::ReconciliationComplete, "")
                .with_payload("version", version.to_string()),
        );
    }

    async fn execute(
        &self,
        planned: &PlannedAction,
        desired: &BTreeMap<String, Arc<ServerConfig>>,
    ) -> Result<(), String> {
        let name = planned.server.as_str();
        match planned.action {
            ReconcileAction::None => Ok(()),
            ReconcileAction::Connect => {
                let config = desired
                    .get(name)
                    .cloned()
                    .ok_or_else(|| format!("server '{name}' missing from desired state"))?;
                let sender = self.ensure_actor(name, config).await;
                sender
                    .send(Command::Connect)
                    .await
                    .map_err(|_| format!("actor for '{name}' is gone"))
            }
            ReconcileAction::Disconnect => {
                let sender = self
                    .sender_for(name)
                    .await
                    .ok_or_else(|| format!("no actor for '{name}'"))?;
                sender
                    .send(Command::Disconnect)
                    .await
                    .map_err(|_| format!("actor for '{name}' is gone"))
            }
            ReconcileAction::Reconnect => {
                let config = desired
                    .get(name)
                    .cloned()
                    .ok_or_else(|| format!("server '{name}' missing from desired state"))?;
                let should_connect = config.should_connect();
                let sender = self.ensure_actor(name, config.clone()).await;
                sender
                    .send(Command::UpdateConfig(config))
                    .await
                    .map_err(|_| format!("actor for '{name}' is gone"))?;
                // UpdateConfig only bounces live sessions; make sure a
                // dormant server still comes up under the new config.
                if should_connect {
                    sender
                        .send(Command::Connect)
                        .await
                        .map_err(|_| format!("actor for '{name}' is gone"))?;
                }
                Ok(())
            }
            ReconcileAction::Remove => self.remove_actor(name).await,
        }
    }

    async fn sender_for(&self, name: &str) -> Option<mpsc::Sender<Command>> {
        let actors = self.inner.actors.read().await;
        actors.get(name).map(ActorHandle::sender)
    }

    /// Get or create the actor for `name`, returning its command sender.
    async fn ensure_actor(&self, name: &str, config: Arc<ServerConfig>) -> mpsc::Sender<Command> {
        if let Some(sender) = self.sender_for(name).await {
            return sender;
        }

        let mut actors = self.inner.actors.write().await;
        if let Some(handle) = actors.get(name) {
            return handle.sender();
        }

        let state = Arc::new(StateManager::new(name));
        let core = CoreClient::new(
            config.clone(),
            state,
            self.inner.store.clone(),
            self.inner.factory.clone(),
            self.inner.bus.clone(),
        );
        let client = Arc::new(ManagedClient::new(core));
        let handle = actor::spawn_actor(
            name.to_string(),
            client,
            self.inner.bus.clone(),
            config.max_retries,
        );
        let sender = handle.sender();
        actors.insert(name.to_string(), handle);
        drop(actors);

        self.inner
            .bus
            .publish(Event::new(EventKind::ServerAdded, name));
        sender
    }

    async fn remove_actor(&self, name: &str) -> Result<(), String> {
        let handle = {
            let mut actors = self.inner.actors.write().await;
            actors.remove(name)
        };
        // Long work happens after the map lock is gone.
        match handle {
            Some(handle) => {
                handle.stop().await;
                self.inner
                    .bus
                    .publish(Event::new(EventKind::ServerRemoved, name));
                Ok(())
            }
            None => Err(format!("no actor for '{name}'")),
        }
    }

    /// Manager-facing: add one server to the desired set and reconcile it.
    pub async fn add_server(&self, config: ServerConfig) -> Result<(), String> {
        if config.name.is_empty() {
            return Err("server name must not be empty".to_string());
        }
        if config.name.contains(':') {
            return Err("server name must not contain ':'".to_string());
        }
        {
            let mut desired = self
                .inner
                .desired
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if desired.contains_key(&config.name) {
                return Err(format!("server '{}' already exists", config.name));
            }
            desired.insert(config.name.clone(), Arc::new(config));
        }
        self.reconcile().await;
        Ok(())
    }

    /// Manager-facing: drop one server entirely.
    pub async fn remove_server(&self, name: &str) {
        self.inner
            .desired
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(name);
        let _ = self.remove_actor(name).await;
        self.publish_snapshot().await;
    }

    pub async fn client_for(&self, name: &str) -> Option<Arc<ManagedClient>> {
        let actors = self.inner.actors.read().await;
        actors.get(name).map(|handle| handle.client().clone())
    }

    pub async fn clients(&self) -> Vec<(String, Arc<ManagedClient>)> {
        let actors = self.inner.actors.read().await;
        actors
            .iter()
            .map(|(name, handle)| (name.clone(), handle.client().clone()))
            .collect()
    }

    pub fn current_snapshot(&self) -> Arc<ServerStateSnapshot> {
        self.inner.publisher.current()
    }

    async fn publish_snapshot(&self) -> u64 {
        let servers = {
            let actors = self.inner.actors.read().await;
            actors
                .iter()
                .map(|(name, handle)| {
                    let core = handle.client().core();
                    let last_seen_ms = core.last_seen_ms();
                    (
                        name.clone(),
                        ServerState {
                            config: core.config(),
                            info: core.state().info(),
                            tool_count: core.tool_count(),
                            last_seen: (last_seen_ms > 0)
                                .then(|| DateTime::from_timestamp_millis(last_seen_ms))
                                .flatten(),
                        },
                    )
                })
                .collect::<BTreeMap<_, _>>()
        };
        self.inner.publisher.publish(servers)
    }

    /// Idempotent reconnect trigger: Ready/Connecting servers are left
    /// alone, anything else gets a teardown-and-connect. Concurrent
    /// triggers for the same server collapse into one.
    pub async fn retry_connection(&self, name: &str) -> Result<(), String> {
        let Some(client) = self.client_for(name).await else {
            return Err(format!("unknown server '{name}'"));
        };
        self.inner
            .retry_flight
            .run(name.to_string(), move || async move {
                let state = client.core().state().state();
                if matches!(
                    state,
                    ConnectionState::Ready | ConnectionState::Connecting
                ) {
                    return Ok(());
                }
                // Drop stale sockets and headers before dialing again.
                client.disconnect().await;
                client.connect().await.map_err(|e| e.to_string())
            })
            .await
    }

    async fn token_monitor_loop(self) {
        let mut ticker = tokio::time::interval(TOKEN_POLL_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = ticker.tick() => self.token_pass().await,
            }
        }
    }

    /// One poll of both token paths: the completion log and the
    /// token-presence scan over errored servers.
    ///
    /// Both must exist: a sibling process that could not write the
    /// completion event (database lock) is still caught by the scan.
    pub async fn token_pass(&self) {
        match self.inner.store.take_unprocessed() {
            Ok(events) => {
                for event in events {
                    debug!(server = %event.server_name, "oauth completion event");
                    if self.client_for(&event.server_name).await.is_some() {
                        self.stamp_auto_retry(&event.server_name);
                        self.spawn_retry(event.server_name.clone());
                    }
                    // Processed either way; events are at-least-once and a
                    // vanished server has nothing to reconnect.
                    if let Err(err) = self
                        .inner
                        .store
                        .mark_processed(&event.server_name, event.completed_at)
                    {
                        warn!("failed to mark completion processed: {err}");
                    }
                }
            }
            Err(err) => warn!("completion poll failed: {err}"),
        }

        for (name, client) in self.clients().await {
            if client.core().state().state() != ConnectionState::Error {
                continue;
            }
            let config = client.core().config();
            let has_token = matches!(
                self.inner.store.load(&config.name, &config.url),
                Ok(Some(_))
            );
            if has_token && self.auto_retry_due(&name) {
                debug!(server = %name, "token scanner triggering reconnect");
                self.stamp_auto_retry(&name);
                self.spawn_retry(name);
            }
        }

        if let Err(err) = self.inner.store.cleanup_old(COMPLETION_RETENTION) {
            warn!("completion cleanup failed: {err}");
        }
    }

    fn auto_retry_due(&self, name: &str) -> bool {
        let last = self
            .inner
            .last_auto_retry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match last.get(name) {
            Some(at) => at.elapsed() >= AUTO_RETRY_MIN_GAP,
            None => true,
        }
    }

    fn stamp_auto_retry(&self, name: &str) {
        self.inner
            .last_auto_retry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(name.to_string(), Instant::now());
    }

    fn spawn_retry(&self, name: String) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            if let Err(err) = supervisor.retry_connection(&name).await {
                debug!(server = %name, "auto retry failed: {err}");
            }
        });
    }

    /// Cancel everything: actors, monitors, in-flight OAuth flows.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let handles: Vec<ActorHandle> = {
            let mut actors = self.inner.actors.write().await;
            actors.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.stop().await;
        }
        self.publish_snapshot().await;
        info!("supervisor stopped");
    }
}

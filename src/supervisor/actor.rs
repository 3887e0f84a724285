//! Per-server actor: one long-lived task owning one managed client.
//!
//! All lifecycle mutations for a server funnel through its actor's command
//! channel, so state changes are serialized without extra locking. Failed
//! connects re-arm themselves: a small task sleeps out the backoff and
//! re-queues `Connect`.

use super::backoff::Backoff;
use crate::client::managed::ManagedClient;
use crate::config::ServerConfig;
use crate::events::{Event, EventBus, EventKind};
use crate::state::ConnectionState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const COMMAND_BUFFER: usize = 16;
/// Settle time between disconnect and reconnect on a config swap.
const RECONNECT_GAP: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub enum Command {
    Connect,
    Disconnect,
    UpdateConfig(Arc<ServerConfig>),
    Stop,
}

/// Handle the supervisor keeps per server.
pub struct ActorHandle {
    name: String,
    client: Arc<ManagedClient>,
    tx: mpsc::Sender<Command>,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl ActorHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> &Arc<ManagedClient> {
        &self.client
    }

    /// Clone of the command sender, so callers can release any locks
    /// before awaiting channel capacity.
    pub fn sender(&self) -> mpsc::Sender<Command> {
        self.tx.clone()
    }

    /// Stop the actor and wait for its loop to exit.
    pub async fn stop(self) {
        let _ = self.tx.send(Command::Stop).await;
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            warn!(server = %self.name, "actor task panicked: {err}");
        }
    }
}

/// Spawn the actor for one server.
///
/// `max_retries` bounds automatic connect retries; `None` retries forever.
pub fn spawn_actor(
    name: String,
    client: Arc<ManagedClient>,
    bus: Arc<EventBus>,
    max_retries: Option<u32>,
) -> ActorHandle {
    let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
    let cancel = CancellationToken::new();

    // Every FSM transition fans out as a StateChanged event.
    {
        let bus = bus.clone();
        let server = name.clone();
        client.core().state().on_change(move |from, to, info| {
            let mut event = Event::new(EventKind::StateChanged, server.clone())
                .with_payload("from", from.as_str())
                .with_payload("to", to.as_str());
            if let Some(error) = &info.last_error {
                event = event.with_error(error.clone());
            }
            bus.publish(event);
        });
    }

    let task = tokio::spawn(actor_loop(
        name.clone(),
        client.clone(),
        rx,
        tx.clone(),
        bus,
        cancel.clone(),
        max_retries,
    ));

    ActorHandle {
        name,
        client,
        tx,
        cancel,
        task,
    }
}

#[allow(clippy::too_many_arguments)]
async fn actor_loop(
    name: String,
    client: Arc<ManagedClient>,
    mut rx: mpsc::Receiver<Command>,
    tx: mpsc::Sender<Command>,
    bus: Arc<EventBus>,
    cancel: CancellationToken,
    max_retries: Option<u32>,
) {
    let mut backoff = Backoff::connect_default();
    let probe = client.spawn_health_probe(cancel.child_token());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            command = rx.recv() => {
                let Some(command) = command else { break };
                match command {
                    Command::Connect => {
                        handle_connect(
                            &name, &client, &tx, &bus, &cancel, &mut backoff, max_retries,
                        )
                        .await;
                    }
                    Command::Disconnect => {
                        if client.core().state().state() == ConnectionState::Ready {
                            client.disconnect().await;
                            bus.publish(Event::new(EventKind::Disconnected, name.clone()));
                        }
                    }
                    Command::UpdateConfig(config) => {
                        let reconnect = config.should_connect();
                        let was_ready =
                            client.core().state().state() == ConnectionState::Ready;
                        client.set_config(config);
                        if was_ready {
                            client.disconnect().await;
                            bus.publish(Event::new(EventKind::Disconnected, name.clone()));
                            if reconnect {
                                tokio::time::sleep(RECONNECT_GAP).await;
                                handle_connect(
                                    &name, &client, &tx, &bus, &cancel, &mut backoff, max_retries,
                                )
                                .await;
                            }
                        }
                    }
                    Command::Stop => break,
                }
            }
        }
    }

    probe.abort();
    client.core().force_close().await;
    client.core().state().transition_to(ConnectionState::Stopped);
    info!(server = %name, "actor stopped");
}

async fn handle_connect(
    name: &str,
    client: &Arc<ManagedClient>,
    tx: &mpsc::Sender<Command>,
    bus: &Arc<EventBus>,
    cancel: &CancellationToken,
    backoff: &mut Backoff,
    max_retries: Option<u32>,
) {
    let state = client.core().state().state();
    if matches!(
        state,
        ConnectionState::Ready | ConnectionState::Connecting
    ) {
        debug!(server = %name, state = state.as_str(), "connect is a no-op");
        return;
    }

    // Shutdown must not wait on a slow dial or an interactive OAuth flow.
    let result = tokio::select! {
        _ = cancel.cancelled() => return,
        result = client.connect() => result,
    };
    match result {
        Ok(()) => {
            backoff.reset();
            bus.publish(Event::new(EventKind::Connected, name.to_string()));
        }
        Err(err) => {
            bus.publish(
                Event::new(EventKind::Error, name.to_string()).with_error(err.to_string()),
            );

            let exhausted = max_retries.is_some_and(|cap| backoff.attempt() >= cap);
            if exhausted {
                warn!(server = %name, "connect retries exhausted");
                return;
            }

            let delay = backoff.next();
            bus.publish(
                Event::new(EventKind::Retrying, name.to_string())
                    .with_payload("attempt", backoff.attempt().to_string())
                    .with_payload("delay_ms", delay.as_millis().to_string()),
            );

            // Re-arm: sleep out the backoff, then queue another Connect
            // unless shutdown got there first.
            let tx = tx.clone();
            let cancel = cancel.clone();
            let server = name.to_string();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {
                        if tx.try_send(Command::Connect).is_err() {
                            debug!(server = %server, "retry dropped, command queue unavailable");
                        }
                    }
                }
            });
        }
    }
}

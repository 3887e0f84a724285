//! mcpherd daemon - supervise a fleet of upstream MCP servers
//!
//! Loads the server config, opens the token store, and runs the supervisor
//! until interrupted. Config edits are picked up live; OAuth tokens and
//! completion events are the only state that survives restarts.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

use mcpherd::config;
use mcpherd::manager::Manager;
use mcpherd::paths;
use mcpherd::store::TokenStore;
use mcpherd::transport::RmcpFactory;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mcpherd=info".parse()?),
        )
        .init();

    paths::ensure_dirs()?;
    paths::log_paths();

    let store = Arc::new(TokenStore::open(paths::db_path()).context("failed to open token store")?);
    let manager = Manager::new(store, Arc::new(RmcpFactory));

    let (config_tx, config_rx) = tokio::sync::mpsc::channel(8);
    let _watcher = config::watch_settings(paths::settings_path(), config_tx)
        .context("failed to start config watcher")?;

    let supervisor_handle = manager.start(config_rx);

    // Mirror lifecycle events into the log.
    let mut events = manager.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match &event.error {
                Some(error) => {
                    warn!(server = %event.server, kind = ?event.kind, error = %error, "event")
                }
                None => debug!(server = %event.server, kind = ?event.kind, "event"),
            }
        }
    });

    info!("mcpherd running; press ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("shutting down");
    manager.disconnect_all().await;
    let _ = supervisor_handle.await;
    Ok(())
}

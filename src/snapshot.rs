//! Immutable, versioned view of the whole fleet.
//!
//! The supervisor rebuilds a [`ServerStateSnapshot`] after every
//! reconciliation pass and swaps it in behind an `Arc`. Readers clone the
//! `Arc` and never hold a lock while inspecting it, so they may briefly see
//! an older version but never a partial one.

use crate::config::ServerConfig;
use crate::state::ConnectionInfo;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Live view of one server: desired config plus observed connection state.
#[derive(Debug, Clone)]
pub struct ServerState {
    pub config: Arc<ServerConfig>,
    pub info: ConnectionInfo,
    pub tool_count: usize,
    pub last_seen: Option<DateTime<Utc>>,
}

/// One published generation of the fleet view.
#[derive(Debug, Clone)]
pub struct ServerStateSnapshot {
    /// Strictly increasing across publishes.
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub servers: BTreeMap<String, ServerState>,
}

impl ServerStateSnapshot {
    fn empty() -> Self {
        Self {
            version: 0,
            timestamp: Utc::now(),
            servers: BTreeMap::new(),
        }
    }
}

/// Swap-on-publish holder for the current snapshot.
pub struct SnapshotPublisher {
    current: RwLock<Arc<ServerStateSnapshot>>,
}

impl SnapshotPublisher {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(ServerStateSnapshot::empty())),
        }
    }

    /// The latest published snapshot.
    pub fn current(&self) -> Arc<ServerStateSnapshot> {
        self.current
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Publish a new generation; returns its version.
    pub fn publish(&self, servers: BTreeMap<String, ServerState>) -> u64 {
        let mut current = self
            .current
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let version = current.version + 1;
        *current = Arc::new(ServerStateSnapshot {
            version,
            timestamp: Utc::now(),
            servers,
        });
        version
    }
}

impl Default for SnapshotPublisher {
    fn default() -> Self {
        Self::new()
    }
}

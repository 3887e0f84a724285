//! Reconciliation plan computation.
//!
//! Pure diff of desired config against observed connection state, producing
//! the minimal set of actions that moves the fleet toward the snapshot.

use crate::config::ServerConfig;
use crate::state::ConnectionState;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    None,
    Connect,
    Disconnect,
    Reconnect,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedAction {
    pub server: String,
    pub action: ReconcileAction,
}

/// Observed side of the diff: the config an actor currently runs with and
/// where its connection is.
#[derive(Debug, Clone)]
pub struct ObservedServer {
    pub config: Arc<ServerConfig>,
    pub state: ConnectionState,
}

/// A connection that exists or is being established.
pub fn is_connected_state(state: ConnectionState) -> bool {
    matches!(
        state,
        ConnectionState::Connecting
            | ConnectionState::Authenticating
            | ConnectionState::Discovering
            | ConnectionState::Ready
    )
}

/// Diff `desired` against `observed`. `None` actions are filtered out;
/// order is deterministic (sorted by server name, removals last).
pub fn compute_plan(
    desired: &BTreeMap<String, Arc<ServerConfig>>,
    observed: &BTreeMap<String, ObservedServer>,
) -> Vec<PlannedAction> {
    let mut plan = Vec::new();

    for (name, want) in desired {
        let action = match observed.get(name) {
            None => {
                if want.should_connect() {
                    ReconcileAction::Connect
                } else {
                    ReconcileAction::None
                }
            }
            Some(have) => {
                if want.materially_differs(&have.config) {
                    ReconcileAction::Reconnect
                } else if want.should_connect() && !is_connected_state(have.state) {
                    ReconcileAction::Connect
                } else if !want.should_connect() && is_connected_state(have.state) {
                    ReconcileAction::Disconnect
                } else {
                    ReconcileAction::None
                }
            }
        };
        if action != ReconcileAction::None {
            plan.push(PlannedAction {
                server: name.clone(),
                action,
            });
        }
    }

    for name in observed.keys() {
        if !desired.contains_key(name) {
            plan.push(PlannedAction {
                server: name.clone(),
                action: ReconcileAction::Remove,
            });
        }
    }

    plan
}

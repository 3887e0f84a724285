//! mcpherd - proxy and supervisor for a fleet of upstream MCP servers
//!
//! One uniform surface over many heterogeneous MCP upstreams: the
//! [`manager::Manager`] owns a [`supervisor::Supervisor`] that reconciles
//! desired config against live connections, drives OAuth when an upstream
//! demands it, and multiplexes tool discovery and invocation. The daemon
//! binary is in `main.rs`.

pub mod client;
pub mod config;
pub mod events;
pub mod flight;
pub mod manager;
pub mod oauth;
pub mod paths;
pub mod snapshot;
pub mod state;
pub mod store;
pub mod supervisor;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

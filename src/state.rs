//! Per-server connection state machine.
//!
//! The [`StateManager`] records what a connection actually did. Transition
//! validation is advisory: an out-of-graph transition is logged at warn and
//! applied anyway, because real upstreams fail in ways no fixed graph
//! anticipates. The machine is a recorder, not an enforcer.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::warn;

/// Where a connection currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Authenticating = 2,
    Discovering = 3,
    Ready = 4,
    Error = 5,
    /// Terminal; entered when the owning actor shuts down.
    Stopped = 6,
}

impl ConnectionState {
    /// State name for display and event payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Discovering => "discovering",
            ConnectionState::Ready => "ready",
            ConnectionState::Error => "error",
            ConnectionState::Stopped => "stopped",
        }
    }

    fn from_u8(value: u8) -> ConnectionState {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Authenticating,
            3 => ConnectionState::Discovering,
            4 => ConnectionState::Ready,
            5 => ConnectionState::Error,
            6 => ConnectionState::Stopped,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Everything observers get to see about a connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub state: ConnectionState,
    pub last_error: Option<String>,
    pub retry_count: u32,
    pub last_retry_time: Option<Instant>,
    /// Upstream-reported identity, populated before entering Ready.
    pub server_name: Option<String>,
    pub server_version: Option<String>,
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            last_error: None,
            retry_count: 0,
            last_retry_time: None,
            server_name: None,
            server_version: None,
        }
    }
}

/// Retry delay ceiling.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);
/// Exponent clamp so `1 << (k - 1)` cannot overflow.
const MAX_RETRY_EXPONENT: u32 = 30;

/// Delay owed after `retry_count` consecutive failures.
pub fn retry_delay(retry_count: u32) -> Duration {
    if retry_count == 0 {
        return Duration::ZERO;
    }
    let exponent = (retry_count - 1).min(MAX_RETRY_EXPONENT);
    Duration::from_secs(1u64 << exponent).min(MAX_RETRY_DELAY)
}

fn transition_allowed(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;
    if to == Stopped {
        return true;
    }
    matches!(
        (from, to),
        (Disconnected, Connecting)
            | (Connecting, Authenticating)
            | (Connecting, Discovering)
            | (Connecting, Error)
            | (Connecting, Disconnected)
            | (Authenticating, Connecting)
            | (Authenticating, Error)
            | (Authenticating, Disconnected)
            | (Discovering, Ready)
            | (Discovering, Error)
            | (Discovering, Disconnected)
            | (Ready, Error)
            | (Ready, Disconnected)
            | (Error, Connecting)
            | (Error, Disconnected)
    )
}

type ChangeCallback = Box<dyn Fn(ConnectionState, ConnectionState, &ConnectionInfo) + Send + Sync>;

/// Thread-safe holder of one connection's [`ConnectionInfo`].
///
/// Only the owning client/actor transitions it; concurrent readers use the
/// atomic [`state`](StateManager::state) slot or clone [`info`](StateManager::info).
pub struct StateManager {
    server: String,
    info: RwLock<ConnectionInfo>,
    // Mirrors info.state for lock-free reads.
    state: AtomicU8,
    callback: RwLock<Option<ChangeCallback>>,
}

impl StateManager {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            info: RwLock::new(ConnectionInfo::default()),
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            callback: RwLock::new(None),
        }
    }

    /// Register the single on-change observer, replacing any previous one.
    ///
    /// The callback runs after the state lock is released and must not call
    /// back into this manager synchronously with a blocking operation.
    pub fn on_change<F>(&self, callback: F)
    where
        F: Fn(ConnectionState, ConnectionState, &ConnectionInfo) + Send + Sync + 'static,
    {
        *self
            .callback
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(Box::new(callback));
    }

    /// Lock-free state read.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Snapshot of the full info record.
    pub fn info(&self) -> ConnectionInfo {
        self.info
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Apply a transition, dispatching the observer outside the lock.
    ///
    /// Entering Ready clears `last_error` and zeroes `retry_count`.
    pub fn transition_to(&self, to: ConnectionState) {
        let (from, snapshot) = {
            let mut info = self
                .info
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let from = info.state;
            if !transition_allowed(from, to) {
                warn!(
                    server = %self.server,
                    from = from.as_str(),
                    to = to.as_str(),
                    "illegal state transition, applying anyway"
                );
            }
            info.state = to;
            if to == ConnectionState::Ready {
                info.last_error = None;
                info.retry_count = 0;
            }
            self.state.store(to as u8, Ordering::Release);
            (from, info.clone())
        };

        self.dispatch(from, to, &snapshot);
    }

    /// Record a failure: transition to Error, bump the retry counter, stamp
    /// the retry clock.
    pub fn set_error(&self, error: impl Into<String>) {
        let to = ConnectionState::Error;
        let (from, snapshot) = {
            let mut info = self
                .info
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let from = info.state;
            if !transition_allowed(from, to) {
                warn!(
                    server = %self.server,
                    from = from.as_str(),
                    to = to.as_str(),
                    "illegal state transition, applying anyway"
                );
            }
            info.state = to;
            info.last_error = Some(error.into());
            info.retry_count = info.retry_count.saturating_add(1);
            info.last_retry_time = Some(Instant::now());
            self.state.store(to as u8, Ordering::Release);
            (from, info.clone())
        };

        self.dispatch(from, to, &snapshot);
    }

    /// Record the upstream's self-reported identity.
    pub fn set_server_info(&self, name: impl Into<String>, version: impl Into<String>) {
        let mut info = self
            .info
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        info.server_name = Some(name.into());
        info.server_version = Some(version.into());
    }

    /// True when an errored connection has waited out its backoff.
    ///
    /// The delay after `k` consecutive failures is `min(2^(k-1) s, 5 min)`;
    /// a zero retry count is immediately eligible.
    pub fn should_retry(&self) -> bool {
        let info = self
            .info
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if info.state != ConnectionState::Error {
            return false;
        }
        if info.retry_count == 0 {
            return true;
        }
        match info.last_retry_time {
            Some(last) => last.elapsed() >= retry_delay(info.retry_count),
            None => true,
        }
    }

    /// Return to Disconnected and forget history.
    pub fn reset(&self) {
        let to = ConnectionState::Disconnected;
        let (from, snapshot) = {
            let mut info = self
                .info
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let from = info.state;
            *info = ConnectionInfo::default();
            self.state.store(to as u8, Ordering::Release);
            (from, info.clone())
        };

        self.dispatch(from, to, &snapshot);
    }

    fn dispatch(&self, from: ConnectionState, to: ConnectionState, snapshot: &ConnectionInfo) {
        let callback = self
            .callback
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(cb) = callback.as_ref() {
            cb(from, to, snapshot);
        }
    }

    /// Pretend the last retry happened `by` earlier than it did.
    #[cfg(test)]
    pub fn backdate_last_retry(&self, by: Duration) {
        let mut info = self
            .info
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(last) = info.last_retry_time {
            info.last_retry_time = Some(last.checked_sub(by).unwrap_or(last));
        }
    }
}

//! Per-connection identity and state.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tether_core::ConnectionId;
use tokio::time::Instant;

/// Which binding accepted the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Length-prefixed frames on a TCP stream.
    Raw,
    /// One frame per WebSocket binary message.
    Framed,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raw => f.write_str("tcp"),
            Self::Framed => f.write_str("websocket"),
        }
    }
}

/// Connection lifecycle. Only ever moves forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Serving requests.
    Active,
    /// Draining: in-flight requests continue, new ones are refused.
    Closing,
    /// Transport closed.
    Closed,
}

/// One accepted connection.
pub struct Connection {
    /// Unique connection id.
    pub id: ConnectionId,
    /// Binding that accepted it.
    pub transport: TransportKind,
    /// Peer address as reported by the listener.
    pub remote_address: String,
    /// Wall-clock accept time.
    pub opened_at: DateTime<Utc>,
    state: Mutex<ConnectionState>,
    last_activity: Mutex<Instant>,
}

impl Connection {
    /// Create an active connection with a fresh id.
    pub fn new(transport: TransportKind, remote_address: impl Into<String>) -> Self {
        Self {
            id: ConnectionId::new(),
            transport,
            remote_address: remote_address.into(),
            opened_at: Utc::now(),
            state: Mutex::new(ConnectionState::Active),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Move to `next` unless already past it. Returns whether the state changed.
    pub fn advance(&self, next: ConnectionState) -> bool {
        let mut state = self.state.lock();
        if next > *state {
            *state = next;
            true
        } else {
            false
        }
    }

    /// Record inbound traffic.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the last inbound frame (or accept).
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Time since accept.
    pub fn age(&self) -> Duration {
        let opened = self.opened_at;
        (Utc::now() - opened).to_std().unwrap_or_default()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("transport", &self.transport)
            .field("remote_address", &self.remote_address)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

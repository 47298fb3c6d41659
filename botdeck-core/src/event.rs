//! Event bus: fan-out of auth progress and per-connection session events.
//!
//! Single writer (the core), many readers. Two channel families: one logical
//! auth-progress stream, and one lazily-created stream per connection id.
//! Delivery order within a channel matches production order; there is no
//! cross-channel ordering and no replay — a late subscriber only sees events
//! emitted after it subscribed.
//!
//! Payloads are tagged unions so consumers can match exhaustively. They are
//! serialized with `#[serde(tag = "type", content = "data")]` for observers
//! that forward them as JSON.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::registry::ConnectionId;

/// Capacity of each broadcast channel. Slow subscribers that fall further
/// behind than this start seeing `Lagged` errors instead of stalling the
/// producer.
const CHANNEL_CAPACITY: usize = 256;

/// Phase of an interactive authentication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthPhase {
    Pending,
    Polling,
    Success,
    Error,
}

/// Progress update broadcast while a device-code flow advances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthProgress {
    pub state: AuthPhase,
    pub message: String,
}

/// Per-connection event stream payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ConnectionEvent {
    /// An inbound chat line, styling markup intact.
    ChatLine { text: String },
    /// Liveness changed.
    StateChanged {
        connected: bool,
        reason: Option<String>,
    },
}

/// Publish/subscribe hub bridging session activity to observers.
pub struct EventBus {
    auth: broadcast::Sender<AuthProgress>,
    connections: Mutex<HashMap<ConnectionId, broadcast::Sender<ConnectionEvent>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (auth, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            auth,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribes to the auth-progress stream.
    pub fn subscribe_auth(&self) -> broadcast::Receiver<AuthProgress> {
        self.auth.subscribe()
    }

    /// Subscribes to one connection's event stream, creating it if needed.
    pub fn subscribe_connection(&self, id: ConnectionId) -> broadcast::Receiver<ConnectionEvent> {
        self.connections
            .lock()
            .entry(id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn publish_auth(&self, state: AuthPhase, message: impl Into<String>) {
        let progress = AuthProgress {
            state,
            message: message.into(),
        };
        tracing::debug!(?progress.state, %progress.message, "auth progress");
        // No subscribers is fine; progress events are advisory.
        let _ = self.auth.send(progress);
    }

    pub fn publish_connection(&self, id: ConnectionId, event: ConnectionEvent) {
        let sender = {
            self.connections
                .lock()
                .entry(id)
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .clone()
        };
        let _ = sender.send(event);
    }

    /// Drops a connection's channel once the connection is removed.
    pub fn retire_connection(&self, id: ConnectionId) {
        self.connections.lock().remove(&id);
    }
}

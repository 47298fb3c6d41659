//! Protocol engine seam.
//!
//! The game wire protocol (framing, codecs, multi-version translation) lives
//! outside the core. The core asks a [`ProtocolEngine`] for a live session
//! and drives it through channels: commands go down an mpsc sender, inbound
//! chat and liveness changes come back on an mpsc receiver, and the engine's
//! internal task can be cancelled unconditionally through its
//! [`AbortHandle`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::registry::ServerEntry;

/// A protocol version string, e.g. `"1.21"`.
///
/// The set of versions the engine can speak is owned by the engine; the core
/// only checks membership.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtocolVersion(pub String);

impl ProtocolVersion {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProtocolVersion {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Where to connect.
#[derive(Debug, Clone)]
pub struct ServerTarget {
    pub host: String,
    pub port: u16,
}

impl From<&ServerEntry> for ServerTarget {
    fn from(entry: &ServerEntry) -> Self {
        Self {
            host: entry.host.clone(),
            port: entry.port,
        }
    }
}

/// Credentials handed to the engine when opening a session.
#[derive(Debug, Clone)]
pub enum SessionCredentials {
    /// Unauthenticated session; the server derives the identity.
    Offline { username: String },
    /// Authenticated session with a live bearer token.
    Bearer {
        username: String,
        uuid: Uuid,
        access_token: String,
    },
}

/// Commands the core sends into a live session.
#[derive(Debug)]
pub enum SessionCommand {
    /// Relay a chat line to the server.
    Chat(String),
    /// Perform a protocol-level disconnect and wind the session down.
    Disconnect,
}

/// Events a live session emits back to the core.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// An inbound chat line, as a display string preserving inline styling.
    ChatLine { text: String },
    /// Liveness changed. `connected: false` means the session is over.
    StateChanged {
        connected: bool,
        reason: Option<String>,
    },
}

/// A live session handle produced by the engine.
///
/// Dropping the handle alone does not stop the engine's internal task; call
/// [`AbortHandle::abort`] (hard kill) or send [`SessionCommand::Disconnect`]
/// (soft kill) first.
pub struct EngineSession {
    pub commands: mpsc::Sender<SessionCommand>,
    pub events: mpsc::Receiver<SessionEvent>,
    pub abort: AbortHandle,
}

/// External protocol engine collaborator.
#[async_trait]
pub trait ProtocolEngine: Send + Sync {
    /// Protocol versions this engine can speak.
    fn supported_versions(&self) -> Vec<ProtocolVersion>;

    /// Opens a live session. Returning `Ok` means the handle is established
    /// and the session is live on the wire.
    async fn open(
        &self,
        target: ServerTarget,
        version: &ProtocolVersion,
        credentials: SessionCredentials,
    ) -> anyhow::Result<EngineSession>;
}

//! Connection lifecycle management.
//!
//! Every connection is one bot session bound to a server/version pair. Live
//! sessions run as independent tasks: an engine-owned task speaks the wire
//! protocol, and a core-owned pump task drains its events, updates liveness,
//! and republishes on the event bus. The client table lock is only ever held
//! for structural mutations — never across an await — so snapshots and other
//! sessions are never stalled by a slow peer.
//!
//! State machine: `Idle → Connecting → Connected → Disconnecting →
//! Terminated` on the cooperative path; any non-terminal state can be
//! hard-killed straight to `Terminated`. `Terminated` is final: the entry
//! stays in the table until explicitly removed, but can never reconnect.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};

use crate::core::Core;
use crate::engine::{
    EngineSession, ProtocolVersion, SessionCommand, SessionCredentials, SessionEvent,
};
use crate::error::CoreError;
use crate::event::{ConnectionEvent, EventBus};
use crate::registry::{Client, ClientId, ConnectionId, IdentityKind};

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Terminated,
}

/// Process-scoped half of a live session. Dropping it aborts both the
/// engine task and the pump, so resource release is guaranteed even when
/// cancellation races an in-flight send.
struct ConnectionRuntime {
    commands: mpsc::Sender<SessionCommand>,
    engine_abort: AbortHandle,
    pump: JoinHandle<()>,
}

impl Drop for ConnectionRuntime {
    fn drop(&mut self) {
        self.engine_abort.abort();
        self.pump.abort();
    }
}

/// One bot session bound to a server/version pair.
pub struct Connection {
    pub id: ConnectionId,
    /// Name key into the server registry. Weak: the entry may be deleted
    /// while this connection lives.
    pub server: String,
    pub version: ProtocolVersion,
    state: Arc<watch::Sender<ConnectionState>>,
    runtime: Option<ConnectionRuntime>,
}

impl Connection {
    pub fn new(id: ConnectionId, server: String, version: ProtocolVersion) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            id,
            server,
            version,
            state: Arc::new(state),
            runtime: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == ConnectionState::Terminated
    }

    /// Whether a session underlies this connection right now.
    pub fn is_live(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connecting
                | ConnectionState::Connected
                | ConnectionState::Disconnecting
        )
    }

    /// Immediate teardown without bus traffic, for process shutdown.
    pub(crate) fn terminate_for_shutdown(&mut self) {
        if !self.is_terminated() {
            self.set_state(ConnectionState::Terminated);
        }
        drop(self.runtime.take());
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_replace(next);
    }

    fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }
}

/// Point-in-time view of one connection, as returned by
/// [`Core::list_instances`].
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub connected: bool,
    pub server: String,
    pub version: ProtocolVersion,
    pub state: ConnectionState,
}

/// Drains engine events for one session: chat lines go to the bus, liveness
/// changes update the shared state. When the engine closes its event channel
/// without an explicit down event, the connection is still terminated.
async fn pump(
    id: ConnectionId,
    mut events: mpsc::Receiver<SessionEvent>,
    bus: Arc<EventBus>,
    state: Arc<watch::Sender<ConnectionState>>,
) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::ChatLine { text } => {
                bus.publish_connection(id, ConnectionEvent::ChatLine { text });
            }
            SessionEvent::StateChanged { connected, reason } => {
                let next = if connected {
                    ConnectionState::Connected
                } else {
                    ConnectionState::Terminated
                };
                state.send_replace(next);
                bus.publish_connection(id, ConnectionEvent::StateChanged { connected, reason });
                if !connected {
                    break;
                }
            }
        }
    }
    if *state.borrow() != ConnectionState::Terminated {
        tracing::debug!(connection = %id, "engine event channel closed, terminating");
        state.send_replace(ConnectionState::Terminated);
        bus.publish_connection(
            id,
            ConnectionEvent::StateChanged {
                connected: false,
                reason: None,
            },
        );
    }
}

enum SoftKill {
    /// Already terminated; nothing to do.
    Done,
    /// No live session to wind down; terminated on the spot.
    Immediate,
    /// A live session was asked to disconnect; wait for confirmation.
    Cooperative {
        commands: mpsc::Sender<SessionCommand>,
        state_rx: watch::Receiver<ConnectionState>,
    },
}

impl Core {
    /// Allocates a new `Idle` connection for a client.
    ///
    /// Fails if the server is unknown, the version is not supported by the
    /// engine, or the client already has a non-terminated connection for the
    /// same (server, version) pair.
    pub fn create_connection(
        &self,
        client_id: ClientId,
        server_name: &str,
        version: ProtocolVersion,
    ) -> Result<ConnectionId, CoreError> {
        if !self.engine.supported_versions().contains(&version) {
            return Err(CoreError::Validation(format!(
                "protocol version {version} is not supported"
            )));
        }
        if !self.servers.lock().contains_key(server_name) {
            return Err(CoreError::UnknownServer(server_name.to_string()));
        }

        let mut clients = self.clients.lock();
        let client = clients
            .get_mut(&client_id)
            .ok_or_else(|| CoreError::UnknownClient(client_id.to_string()))?;
        let duplicate = client.connections.values().any(|conn| {
            !conn.is_terminated() && conn.server == server_name && conn.version == version
        });
        if duplicate {
            return Err(CoreError::DuplicateConnection {
                server: server_name.to_string(),
                version: version.to_string(),
            });
        }

        let id = ConnectionId(uuid::Uuid::new_v4());
        client
            .connections
            .insert(id, Connection::new(id, server_name.to_string(), version));
        tracing::info!(client = %client_id, connection = %id, server = %server_name, "connection created");
        self.persist_clients(&clients)?;
        Ok(id)
    }

    /// Connects an `Idle` connection. No-op when already connected (or a
    /// connect is already underway). Terminated connections cannot be
    /// revived; create a new one.
    pub async fn connect(
        &self,
        client_id: ClientId,
        conn_id: ConnectionId,
    ) -> Result<(), CoreError> {
        // Phase 1: claim the connection. Lock released before any I/O.
        let (server_name, version, credentials) = {
            let mut clients = self.clients.lock();
            let client = clients
                .get_mut(&client_id)
                .ok_or_else(|| CoreError::UnknownClient(client_id.to_string()))?;
            let credentials = resolve_credentials(client, &self.cache.lock())?;
            let conn = client
                .connections
                .get(&conn_id)
                .ok_or_else(|| CoreError::UnknownConnection(conn_id.to_string()))?;
            match conn.state() {
                ConnectionState::Connected | ConnectionState::Connecting => return Ok(()),
                ConnectionState::Disconnecting | ConnectionState::Terminated => {
                    return Err(CoreError::Connect(
                        "connection is terminated; create a new one".to_string(),
                    ));
                }
                ConnectionState::Idle => {}
            }
            conn.set_state(ConnectionState::Connecting);
            (conn.server.clone(), conn.version.clone(), credentials)
        };

        let target = {
            let servers = self.servers.lock();
            match servers.get(&server_name) {
                Some(entry) => crate::engine::ServerTarget::from(entry),
                None => {
                    self.reset_to_idle(client_id, conn_id);
                    return Err(CoreError::UnknownServer(server_name));
                }
            }
        };

        tracing::info!(client = %client_id, connection = %conn_id, server = %server_name, %version, "connecting");
        let session = match self.engine.open(target, &version, credentials).await {
            Ok(session) => session,
            Err(err) => {
                self.reset_to_idle(client_id, conn_id);
                tracing::warn!(connection = %conn_id, error = %err, "connect failed");
                return Err(CoreError::Connect(err.to_string()));
            }
        };

        // Phase 2: install the runtime, unless the connection was killed or
        // removed while the handshake was in flight.
        let EngineSession {
            commands,
            events,
            abort,
        } = session;
        {
            let mut clients = self.clients.lock();
            let conn = clients
                .get_mut(&client_id)
                .and_then(|c| c.connections.get_mut(&conn_id));
            let Some(conn) = conn else {
                abort.abort();
                return Err(CoreError::Connect(
                    "connection removed during connect".to_string(),
                ));
            };
            if conn.state() != ConnectionState::Connecting {
                abort.abort();
                return Err(CoreError::Connect(
                    "connection cancelled during connect".to_string(),
                ));
            }
            // Connected must be written before the pump runs: the pump may
            // immediately record a terminal state, and Terminated can never
            // be overwritten.
            conn.set_state(ConnectionState::Connected);
            let pump = tokio::spawn(pump(
                conn_id,
                events,
                self.bus.clone(),
                conn.state.clone(),
            ));
            conn.runtime = Some(ConnectionRuntime {
                commands,
                engine_abort: abort,
                pump,
            });
        }
        self.bus.publish_connection(
            conn_id,
            ConnectionEvent::StateChanged {
                connected: true,
                reason: None,
            },
        );
        Ok(())
    }

    /// Cooperative shutdown: asks the session to disconnect at the protocol
    /// level and waits up to the grace period for confirmation, then
    /// escalates to a hard kill so resources are reclaimed either way.
    pub async fn kill_soft(
        &self,
        client_id: ClientId,
        conn_id: ConnectionId,
    ) -> Result<(), CoreError> {
        let action = {
            let mut clients = self.clients.lock();
            let client = clients
                .get_mut(&client_id)
                .ok_or_else(|| CoreError::UnknownClient(client_id.to_string()))?;
            let conn = client
                .connections
                .get_mut(&conn_id)
                .ok_or_else(|| CoreError::UnknownConnection(conn_id.to_string()))?;
            match conn.state() {
                ConnectionState::Terminated => SoftKill::Done,
                ConnectionState::Idle | ConnectionState::Connecting => {
                    conn.set_state(ConnectionState::Terminated);
                    conn.runtime = None;
                    SoftKill::Immediate
                }
                ConnectionState::Connected | ConnectionState::Disconnecting => {
                    conn.set_state(ConnectionState::Disconnecting);
                    match conn.runtime.as_ref() {
                        Some(rt) => SoftKill::Cooperative {
                            commands: rt.commands.clone(),
                            state_rx: conn.subscribe_state(),
                        },
                        None => {
                            conn.set_state(ConnectionState::Terminated);
                            SoftKill::Immediate
                        }
                    }
                }
            }
        };

        match action {
            SoftKill::Done => Ok(()),
            SoftKill::Immediate => {
                self.bus.publish_connection(
                    conn_id,
                    ConnectionEvent::StateChanged {
                        connected: false,
                        reason: None,
                    },
                );
                tracing::info!(connection = %conn_id, "terminated without live session");
                Ok(())
            }
            SoftKill::Cooperative {
                commands,
                mut state_rx,
            } => {
                tracing::info!(connection = %conn_id, "soft kill requested");
                // Channel may already be closed if the session just died;
                // the state watch settles either way.
                let _ = commands.send(SessionCommand::Disconnect).await;
                let confirmed = tokio::time::timeout(
                    self.config.soft_kill_grace,
                    state_rx.wait_for(|s| *s == ConnectionState::Terminated),
                )
                .await;
                match confirmed {
                    Ok(_) => {
                        // Confirmed (or the watch closed, which only happens
                        // when the connection was removed). Reclaim the
                        // finished runtime.
                        let mut clients = self.clients.lock();
                        if let Some(conn) = clients
                            .get_mut(&client_id)
                            .and_then(|c| c.connections.get_mut(&conn_id))
                        {
                            conn.runtime = None;
                        }
                        tracing::info!(connection = %conn_id, "soft kill confirmed");
                        Ok(())
                    }
                    Err(_) => {
                        tracing::warn!(
                            connection = %conn_id,
                            grace = ?self.config.soft_kill_grace,
                            "soft kill grace elapsed, escalating to hard kill"
                        );
                        self.kill_hard(client_id, conn_id)
                    }
                }
            }
        }
    }

    /// Forced shutdown: aborts the session tasks immediately, no protocol
    /// handshake. The remote peer sees an abrupt drop. No-op on an already
    /// terminated connection.
    pub fn kill_hard(&self, client_id: ClientId, conn_id: ConnectionId) -> Result<(), CoreError> {
        let runtime = {
            let mut clients = self.clients.lock();
            let client = clients
                .get_mut(&client_id)
                .ok_or_else(|| CoreError::UnknownClient(client_id.to_string()))?;
            let conn = client
                .connections
                .get_mut(&conn_id)
                .ok_or_else(|| CoreError::UnknownConnection(conn_id.to_string()))?;
            if conn.is_terminated() {
                return Ok(());
            }
            conn.set_state(ConnectionState::Terminated);
            conn.runtime.take()
        };
        // Dropping the runtime aborts the engine and pump tasks.
        drop(runtime);
        self.bus.publish_connection(
            conn_id,
            ConnectionEvent::StateChanged {
                connected: false,
                reason: Some("aborted".to_string()),
            },
        );
        tracing::info!(connection = %conn_id, "hard killed");
        Ok(())
    }

    /// Relays a chat line into a connected session.
    pub async fn send_chat(
        &self,
        client_id: ClientId,
        conn_id: ConnectionId,
        message: &str,
    ) -> Result<(), CoreError> {
        if message.trim().is_empty() {
            return Err(CoreError::EmptyMessage);
        }
        let commands = {
            let clients = self.clients.lock();
            let client = clients
                .get(&client_id)
                .ok_or_else(|| CoreError::UnknownClient(client_id.to_string()))?;
            let conn = client
                .connections
                .get(&conn_id)
                .ok_or_else(|| CoreError::UnknownConnection(conn_id.to_string()))?;
            if !conn.is_connected() {
                return Err(CoreError::NotConnected(format!(
                    "connection {conn_id} is {:?}",
                    conn.state()
                )));
            }
            conn.runtime
                .as_ref()
                .ok_or_else(|| CoreError::NotConnected("no live session".to_string()))?
                .commands
                .clone()
        };
        commands
            .send(SessionCommand::Chat(message.to_string()))
            .await
            .map_err(|_| CoreError::NotConnected("session channel closed".to_string()))
    }

    /// Point-in-time snapshot of a client's connections. Never blocks on
    /// in-flight session activity.
    pub fn list_instances(
        &self,
        client_id: ClientId,
    ) -> Result<HashMap<ConnectionId, InstanceSnapshot>, CoreError> {
        let clients = self.clients.lock();
        let client = clients
            .get(&client_id)
            .ok_or_else(|| CoreError::UnknownClient(client_id.to_string()))?;
        Ok(client
            .connections
            .values()
            .map(|conn| {
                (
                    conn.id,
                    InstanceSnapshot {
                        connected: conn.is_connected(),
                        server: conn.server.clone(),
                        version: conn.version.clone(),
                        state: conn.state(),
                    },
                )
            })
            .collect())
    }

    /// Discards a connection entry, aborting its session if still live.
    pub fn remove_connection(
        &self,
        client_id: ClientId,
        conn_id: ConnectionId,
    ) -> Result<(), CoreError> {
        let conn = {
            let mut clients = self.clients.lock();
            let client = clients
                .get_mut(&client_id)
                .ok_or_else(|| CoreError::UnknownClient(client_id.to_string()))?;
            let conn = client
                .connections
                .remove(&conn_id)
                .ok_or_else(|| CoreError::UnknownConnection(conn_id.to_string()))?;
            self.persist_clients(&clients)?;
            conn
        };
        drop(conn);
        self.bus.retire_connection(conn_id);
        tracing::info!(client = %client_id, connection = %conn_id, "connection removed");
        Ok(())
    }

    fn reset_to_idle(&self, client_id: ClientId, conn_id: ConnectionId) {
        let clients = self.clients.lock();
        if let Some(conn) = clients
            .get(&client_id)
            .and_then(|c| c.connections.get(&conn_id))
        {
            // Only unwind our own claim; a concurrent kill wins.
            if conn.state() == ConnectionState::Connecting {
                conn.set_state(ConnectionState::Idle);
            }
        }
    }
}

/// Builds the engine credentials for a client from its in-memory token or,
/// failing that, a still-valid cache entry for its profile.
fn resolve_credentials(
    client: &Client,
    cache: &HashMap<String, crate::auth::AuthCacheEntry>,
) -> Result<SessionCredentials, CoreError> {
    match client.kind {
        IdentityKind::Offline => Ok(SessionCredentials::Offline {
            username: client.profile.username.clone(),
        }),
        IdentityKind::Microsoft => {
            if let Some(token) = &client.access_token {
                return Ok(SessionCredentials::Bearer {
                    username: client.profile.username.clone(),
                    uuid: client.profile.uuid,
                    access_token: token.clone(),
                });
            }
            let entry = cache
                .values()
                .find(|e| e.profile.uuid == client.profile.uuid && !e.has_expired());
            match entry {
                Some(entry) => Ok(SessionCredentials::Bearer {
                    username: client.profile.username.clone(),
                    uuid: client.profile.uuid,
                    access_token: entry.access_token.clone(),
                }),
                None => Err(CoreError::Auth(
                    "no valid token for this identity; re-authentication required".to_string(),
                )),
            }
        }
    }
}

//! Client and server registries.
//!
//! Clients are registered identities plus their connection tables; servers
//! are plain name/host/port entries. Both survive restarts through the
//! document store. A connection's server reference is a weak lookup key:
//! deleting a server entry never cascades into live connections.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::connection::Connection;
use crate::core::Core;
use crate::engine::ProtocolVersion;
use crate::error::CoreError;
use crate::profile::Profile;

/// Opaque id of a registered client identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub Uuid);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque id of a connection, unique within its client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// How an identity authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentityKind {
    Microsoft,
    Offline,
}

/// A registered player identity and its connection table.
pub struct Client {
    pub id: ClientId,
    pub kind: IdentityKind,
    pub profile: Profile,
    pub connections: HashMap<ConnectionId, Connection>,
    /// Live bearer token for the current process, if authentication has
    /// happened (or been recalled) since startup. Never persisted here; the
    /// durable copy lives in the credential cache.
    pub access_token: Option<String>,
}

impl Client {
    pub fn new(id: ClientId, kind: IdentityKind, profile: Profile) -> Self {
        Self {
            id,
            kind,
            profile,
            connections: HashMap::new(),
            access_token: None,
        }
    }
}

/// A registered server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerEntry {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for ServerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// ── Persisted document shapes ──

/// Durable view of a client. Runtime state (tokens, live sessions) is
/// process-scoped and deliberately absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientDoc {
    pub id: ClientId,
    pub kind: IdentityKind,
    pub profile: Profile,
    pub connections: HashMap<ConnectionId, ConnectionDoc>,
}

/// Durable view of a connection; reloads as `Idle`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionDoc {
    pub id: ConnectionId,
    pub server: String,
    pub version: ProtocolVersion,
}

impl From<&Client> for ClientDoc {
    fn from(client: &Client) -> Self {
        Self {
            id: client.id,
            kind: client.kind,
            profile: client.profile.clone(),
            connections: client
                .connections
                .iter()
                .map(|(id, conn)| {
                    (
                        *id,
                        ConnectionDoc {
                            id: conn.id,
                            server: conn.server.clone(),
                            version: conn.version.clone(),
                        },
                    )
                })
                .collect(),
        }
    }
}

impl From<ClientDoc> for Client {
    fn from(doc: ClientDoc) -> Self {
        let mut client = Client::new(doc.id, doc.kind, doc.profile);
        client.connections = doc
            .connections
            .into_values()
            .map(|c| (c.id, Connection::new(c.id, c.server, c.version)))
            .collect();
        client
    }
}

// ── Summaries returned by the command surface ──

/// Client summary for observers.
#[derive(Debug, Clone, Serialize)]
pub struct ClientSummary {
    pub id: ClientId,
    pub username: String,
    pub uuid: Uuid,
    pub kind: IdentityKind,
    pub instance_count: usize,
}

impl From<&Client> for ClientSummary {
    fn from(client: &Client) -> Self {
        Self {
            id: client.id,
            username: client.profile.username.clone(),
            uuid: client.profile.uuid,
            kind: client.kind,
            instance_count: client.connections.len(),
        }
    }
}

/// Server summary for observers, with the count of live connections that
/// currently reference the entry.
#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub connections: usize,
}

// ── Registry command surface ──

impl Core {
    /// Lists all registered clients.
    pub fn list_clients(&self) -> Vec<ClientSummary> {
        self.clients.lock().values().map(ClientSummary::from).collect()
    }

    /// Looks up one client.
    pub fn get_client(&self, id: ClientId) -> Result<ClientSummary, CoreError> {
        self.clients
            .lock()
            .get(&id)
            .map(ClientSummary::from)
            .ok_or_else(|| CoreError::UnknownClient(id.to_string()))
    }

    /// Removes a client identity, hard-killing any of its live sessions.
    pub fn remove_client(&self, id: ClientId) -> Result<(), CoreError> {
        let client = {
            let mut clients = self.clients.lock();
            let client = clients
                .remove(&id)
                .ok_or_else(|| CoreError::UnknownClient(id.to_string()))?;
            self.persist_clients(&clients)?;
            client
        };
        for (conn_id, conn) in client.connections {
            // Dropping the runtime aborts the pump and engine tasks.
            drop(conn);
            self.bus.retire_connection(conn_id);
        }
        tracing::info!(client = %id, "client removed");
        Ok(())
    }

    /// Lists all registered servers.
    pub fn list_servers(&self) -> Vec<ServerInfo> {
        let servers = self.servers.lock();
        let clients = self.clients.lock();
        servers
            .values()
            .map(|entry| ServerInfo {
                name: entry.name.clone(),
                host: entry.host.clone(),
                port: entry.port,
                connections: clients
                    .values()
                    .flat_map(|c| c.connections.values())
                    .filter(|conn| conn.server == entry.name && conn.is_live())
                    .count(),
            })
            .collect()
    }

    /// Registers a server. The persisted registry is untouched when the name
    /// is already taken.
    pub fn add_server(&self, entry: ServerEntry) -> Result<(), CoreError> {
        let mut servers = self.servers.lock();
        if servers.contains_key(&entry.name) {
            return Err(CoreError::DuplicateServer(entry.name));
        }
        tracing::info!(name = %entry.name, target = %entry, "server registered");
        servers.insert(entry.name.clone(), entry);
        self.persist_servers(&servers)
    }

    /// Removes a server entry. Live connections referencing the name are
    /// left alone; only future lookups fail.
    pub fn remove_server(&self, name: &str) -> Result<(), CoreError> {
        let mut servers = self.servers.lock();
        if servers.remove(name).is_none() {
            return Err(CoreError::UnknownServer(name.to_string()));
        }
        tracing::info!(%name, "server removed");
        self.persist_servers(&servers)
    }

    /// Protocol versions the engine can speak.
    pub fn available_versions(&self) -> Vec<ProtocolVersion> {
        self.engine.supported_versions()
    }
}

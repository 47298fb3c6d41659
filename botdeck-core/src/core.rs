//! The `Core` facade: registries, auth state, collaborators, and lifecycle.
//!
//! One `Core` per process. It is explicitly constructed with its
//! collaborators injected (no ambient globals), loads the registry documents
//! at open, and exposes the whole command surface as inherent methods —
//! spread across `auth/`, `connection.rs`, and `registry.rs`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::auth::{AuthCacheEntry, DeviceFlow, IdentityProvider};
use crate::config::CoreConfig;
use crate::engine::ProtocolEngine;
use crate::error::CoreError;
use crate::event::EventBus;
use crate::registry::{Client, ClientDoc, ClientId, ServerEntry};
use crate::store::{AUTH_CACHE_DOC, CLIENTS_DOC, SERVERS_DOC, Store};

/// The orchestration core.
pub struct Core {
    pub(crate) config: CoreConfig,
    pub(crate) store: Store,
    pub(crate) clients: Mutex<HashMap<ClientId, Client>>,
    pub(crate) servers: Mutex<HashMap<String, ServerEntry>>,
    pub(crate) cache: Mutex<HashMap<String, AuthCacheEntry>>,
    pub(crate) flows: tokio::sync::Mutex<HashMap<String, DeviceFlow>>,
    pub(crate) key_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) engine: Arc<dyn ProtocolEngine>,
    pub(crate) provider: Arc<dyn IdentityProvider>,
}

impl Core {
    /// Opens the core: loads the client registry, server registry, and
    /// credential cache from the data directory. Persisted connections come
    /// back `Idle`; tokens come back needing re-validation.
    pub fn open(
        config: CoreConfig,
        engine: Arc<dyn ProtocolEngine>,
        provider: Arc<dyn IdentityProvider>,
    ) -> Result<Self, CoreError> {
        let store = Store::open(&config.data_dir)?;
        let client_docs: HashMap<ClientId, ClientDoc> = store.load(CLIENTS_DOC)?;
        let servers: HashMap<String, ServerEntry> = store.load(SERVERS_DOC)?;
        let cache: HashMap<String, AuthCacheEntry> = store.load(AUTH_CACHE_DOC)?;
        let clients: HashMap<ClientId, Client> = client_docs
            .into_values()
            .map(|doc| (doc.id, Client::from(doc)))
            .collect();
        tracing::info!(
            clients = clients.len(),
            servers = servers.len(),
            cached_credentials = cache.len(),
            "core opened"
        );
        Ok(Self {
            config,
            store,
            clients: Mutex::new(clients),
            servers: Mutex::new(servers),
            cache: Mutex::new(cache),
            flows: tokio::sync::Mutex::new(HashMap::new()),
            key_locks: Mutex::new(HashMap::new()),
            bus: Arc::new(EventBus::new()),
            engine,
            provider,
        })
    }

    /// The event bus observers subscribe on.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Tears everything down: aborts in-flight device flows and hard-kills
    /// every live session. Registries stay persisted.
    pub async fn shutdown(&self) {
        {
            let mut flows = self.flows.lock().await;
            for (key, flow) in flows.drain() {
                tracing::debug!(login_key = %key, "aborting device flow");
                flow.abort();
            }
        }
        let mut clients = self.clients.lock();
        for client in clients.values_mut() {
            for conn in client.connections.values_mut() {
                conn.terminate_for_shutdown();
            }
        }
        tracing::info!("core shut down");
    }

    pub(crate) fn persist_clients(
        &self,
        clients: &HashMap<ClientId, Client>,
    ) -> Result<(), CoreError> {
        let doc: HashMap<ClientId, ClientDoc> = clients
            .iter()
            .map(|(id, client)| (*id, ClientDoc::from(client)))
            .collect();
        self.store.save(CLIENTS_DOC, &doc)
    }

    pub(crate) fn persist_servers(
        &self,
        servers: &HashMap<String, ServerEntry>,
    ) -> Result<(), CoreError> {
        self.store.save(SERVERS_DOC, servers)
    }

    pub(crate) fn persist_auth_cache(
        &self,
        cache: &HashMap<String, AuthCacheEntry>,
    ) -> Result<(), CoreError> {
        self.store.save_sensitive(AUTH_CACHE_DOC, cache)
    }
}

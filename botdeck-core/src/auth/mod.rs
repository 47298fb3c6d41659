//! Authentication: offline identities, the cached-token shortcut, and the
//! interactive device-code flow.
//!
//! Three paths resolve a login to a registered client:
//! - offline: derive a deterministic profile, no network;
//! - cached: look the login key up in the credential cache and validate the
//!   token upstream (with one refresh attempt if it expired);
//! - device flow: initiate returns a verification URI + code and polls the
//!   provider in the background; finish blocks on the result.
//!
//! Registration is an idempotent upsert keyed by the resolved profile UUID,
//! so a cache-hit path and a device-flow path racing on the same identity
//! converge on one client record instead of tripping a duplicate error.
//! Operations on the same login key are serialized through a per-key mutex;
//! different keys authenticate independently.

mod cache;
mod provider;

pub use cache::AuthCacheEntry;
pub use provider::{
    DeviceAuthorization, DevicePoll, HttpIdentityProvider, IdentityProvider, ProviderConfig,
    ProviderToken,
};

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::core::Core;
use crate::error::CoreError;
use crate::event::{AuthPhase, EventBus};
use crate::profile::Profile;
use crate::registry::{Client, ClientId, IdentityKind};

/// What the user needs to complete a device authorization.
#[derive(Debug, Clone)]
pub struct VerificationHandle {
    pub verification_uri: String,
    pub user_code: String,
}

/// A device-code flow in progress for one login key.
pub(crate) struct DeviceFlow {
    verification: VerificationHandle,
    task: JoinHandle<Result<(ProviderToken, Profile), CoreError>>,
}

impl DeviceFlow {
    pub(crate) fn abort(&self) {
        self.task.abort();
    }
}

impl Core {
    /// Registers (or re-registers) an offline identity. Deterministic: the
    /// same username always resolves to the same profile id.
    pub fn authenticate_offline(&self, username: &str) -> Result<(ClientId, Profile), CoreError> {
        let profile = Profile::offline(username)?;
        let id = self.upsert_client(&profile, IdentityKind::Offline, None)?;
        self.bus.publish_auth(
            AuthPhase::Success,
            format!("offline identity '{username}' registered"),
        );
        Ok((id, profile))
    }

    /// Resolves a login key through the credential cache.
    ///
    /// `CacheMiss` when the key is absent (fall back to the device flow);
    /// `Auth` when an entry exists but its token is invalid and cannot be
    /// refreshed.
    pub async fn authenticate_cached(
        &self,
        login_key: &str,
    ) -> Result<(ClientId, Profile), CoreError> {
        let _key = self.key_lock(login_key).await;
        self.bus
            .publish_auth(AuthPhase::Pending, "looking up credential cache...");
        let entry = self.cache.lock().get(login_key).cloned();
        let Some(mut entry) = entry else {
            self.bus.publish_auth(
                AuthPhase::Error,
                format!("no cached credential for '{login_key}'"),
            );
            return Err(CoreError::CacheMiss(login_key.to_string()));
        };

        if entry.has_expired() {
            let Some(refresh_token) = entry.refresh_token.clone() else {
                self.bus
                    .publish_auth(AuthPhase::Error, "cached token expired");
                return Err(CoreError::Auth(
                    "cached token expired; re-authentication required".to_string(),
                ));
            };
            self.bus
                .publish_auth(AuthPhase::Polling, "cached token expired, refreshing...");
            match self.provider.refresh(&refresh_token).await {
                Ok(token) => {
                    entry.access_token = token.access_token;
                    entry.refresh_token = token.refresh_token.or(Some(refresh_token));
                    entry.expires_at = Utc::now() + TimeDelta::seconds(token.expires_in as i64);
                }
                Err(err) => {
                    self.bus.publish_auth(AuthPhase::Error, err.to_string());
                    return Err(CoreError::Auth(format!(
                        "cached token expired and refresh failed: {err}"
                    )));
                }
            }
        }

        self.bus
            .publish_auth(AuthPhase::Polling, "validating cached token...");
        match self.provider.fetch_profile(&entry.access_token).await {
            Ok(profile) => {
                entry.profile = profile.clone();
                {
                    let mut cache = self.cache.lock();
                    cache.insert(login_key.to_string(), entry.clone());
                    self.persist_auth_cache(&cache)?;
                }
                let id = self.upsert_client(
                    &profile,
                    IdentityKind::Microsoft,
                    Some(entry.access_token),
                )?;
                self.bus.publish_auth(
                    AuthPhase::Success,
                    format!("authenticated '{}' from cache", profile.username),
                );
                Ok((id, profile))
            }
            Err(err) => {
                self.bus.publish_auth(AuthPhase::Error, err.to_string());
                Err(CoreError::Auth(format!("cached token rejected: {err}")))
            }
        }
    }

    /// Starts an interactive device-code flow for a login key and begins
    /// polling in the background. Progress is published on the auth channel.
    ///
    /// Calling this again while a flow for the same key is still polling
    /// returns the existing verification info instead of starting a second
    /// provider exchange.
    pub async fn initiate_device_flow(
        &self,
        login_key: &str,
    ) -> Result<VerificationHandle, CoreError> {
        // Serializes same-key initiations. The flows table lock is only ever
        // held for lookups, so different keys reach the provider in parallel.
        let _key = self.key_lock(login_key).await;
        {
            let flows = self.flows.lock().await;
            if let Some(flow) = flows.get(login_key) {
                if !flow.task.is_finished() {
                    tracing::debug!(%login_key, "device flow already polling, coalescing");
                    return Ok(flow.verification.clone());
                }
            }
        }

        self.bus
            .publish_auth(AuthPhase::Pending, "requesting device authorization...");
        let authorization = match self.provider.begin_device_flow().await {
            Ok(authorization) => authorization,
            Err(err) => {
                self.bus.publish_auth(AuthPhase::Error, err.to_string());
                return Err(err);
            }
        };
        let verification = VerificationHandle {
            verification_uri: authorization.verification_uri.clone(),
            user_code: authorization.user_code.clone(),
        };
        self.bus.publish_auth(
            AuthPhase::Pending,
            format!(
                "enter code {} at {}",
                verification.user_code, verification.verification_uri
            ),
        );

        let deadline = self
            .config
            .device_flow_timeout
            .min(Duration::from_secs(authorization.expires_in));
        let task = tokio::spawn(poll_until_authorized(
            self.provider.clone(),
            self.bus.clone(),
            authorization,
            deadline,
        ));
        tracing::info!(%login_key, "device flow started");
        self.flows.lock().await.insert(
            login_key.to_string(),
            DeviceFlow {
                verification: verification.clone(),
                task,
            },
        );
        Ok(verification)
    }

    /// Blocks on a previously initiated device flow. On success the client
    /// is upserted and, when `persist` is set, the credential is stored in
    /// the cache under `login_key`.
    pub async fn finish_device_flow(
        &self,
        login_key: &str,
        persist: bool,
    ) -> Result<(ClientId, Profile), CoreError> {
        let flow = self.flows.lock().await.remove(login_key);
        let Some(flow) = flow else {
            return Err(CoreError::Auth(format!(
                "no device flow in progress for '{login_key}'"
            )));
        };
        let _key = self.key_lock(login_key).await;
        let (token, profile) = flow
            .task
            .await
            .map_err(|e| CoreError::Auth(format!("device flow task failed: {e}")))??;

        if persist {
            let entry = AuthCacheEntry {
                access_token: token.access_token.clone(),
                refresh_token: token.refresh_token.clone(),
                expires_at: Utc::now() + TimeDelta::seconds(token.expires_in as i64),
                profile: profile.clone(),
            };
            let mut cache = self.cache.lock();
            cache.insert(login_key.to_string(), entry);
            self.persist_auth_cache(&cache)?;
        }
        let id = self.upsert_client(&profile, IdentityKind::Microsoft, Some(token.access_token))?;
        tracing::info!(client = %id, username = %profile.username, "device flow completed");
        Ok((id, profile))
    }

    /// Re-validates the cached token backing an already-registered client.
    ///
    /// `false` means the caller must re-authenticate interactively. Profile
    /// data is never touched on a negative result.
    pub async fn recall_authentication(&self, client_id: ClientId) -> Result<bool, CoreError> {
        let (kind, uuid) = {
            let clients = self.clients.lock();
            let client = clients
                .get(&client_id)
                .ok_or_else(|| CoreError::UnknownClient(client_id.to_string()))?;
            (client.kind, client.profile.uuid)
        };
        if kind == IdentityKind::Offline {
            // Offline identities have no upstream to validate against.
            return Ok(true);
        }

        let entry = self.find_cache_entry(uuid);
        let Some(entry) = entry else {
            return Ok(false);
        };
        if entry.has_expired() {
            return Ok(false);
        }
        match self.provider.fetch_profile(&entry.access_token).await {
            Ok(_) => {
                let mut clients = self.clients.lock();
                if let Some(client) = clients.get_mut(&client_id) {
                    client.access_token = Some(entry.access_token);
                }
                Ok(true)
            }
            Err(err) => {
                tracing::debug!(client = %client_id, error = %err, "recall validation failed");
                Ok(false)
            }
        }
    }

    fn find_cache_entry(&self, profile_uuid: Uuid) -> Option<AuthCacheEntry> {
        self.cache
            .lock()
            .values()
            .find(|e| e.profile.uuid == profile_uuid)
            .cloned()
    }

    /// Idempotent registration keyed by the resolved profile UUID: a second
    /// resolution of the same identity updates the existing record instead
    /// of erroring, regardless of which auth path got there first.
    pub(crate) fn upsert_client(
        &self,
        profile: &Profile,
        kind: IdentityKind,
        access_token: Option<String>,
    ) -> Result<ClientId, CoreError> {
        let mut clients = self.clients.lock();
        if let Some(client) = clients
            .values_mut()
            .find(|c| c.profile.uuid == profile.uuid)
        {
            client.profile = profile.clone();
            client.kind = kind;
            if access_token.is_some() {
                client.access_token = access_token;
            }
            let id = client.id;
            self.persist_clients(&clients)?;
            tracing::debug!(client = %id, username = %profile.username, "client refreshed");
            return Ok(id);
        }
        let id = ClientId(Uuid::new_v4());
        let mut client = Client::new(id, kind, profile.clone());
        client.access_token = access_token;
        clients.insert(id, client);
        self.persist_clients(&clients)?;
        tracing::info!(client = %id, username = %profile.username, ?kind, "client registered");
        Ok(id)
    }

    /// Serializes auth operations on one login key without blocking other
    /// keys. Locks nobody holds anymore are evicted on the way in, so the
    /// table stays proportional to the keys currently authenticating.
    async fn key_lock(&self, login_key: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.key_locks.lock();
            // A uniquely-held Arc means no guard (and no waiter) is alive.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(login_key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Background polling loop for one device authorization, bounded by
/// `deadline`. Publishes progress as it goes.
async fn poll_until_authorized(
    provider: Arc<dyn IdentityProvider>,
    bus: Arc<EventBus>,
    authorization: DeviceAuthorization,
    deadline: Duration,
) -> Result<(ProviderToken, Profile), CoreError> {
    let poll = async {
        let mut interval = Duration::from_secs(authorization.interval);
        loop {
            tokio::time::sleep(interval).await;
            bus.publish_auth(AuthPhase::Polling, "waiting for user authorization...");
            match provider.poll_device_flow(&authorization.device_code).await {
                Ok(DevicePoll::Pending) => {}
                Ok(DevicePoll::SlowDown) => {
                    interval += Duration::from_secs(5);
                }
                Ok(DevicePoll::Complete(token)) => {
                    bus.publish_auth(AuthPhase::Polling, "authorized, resolving profile...");
                    let profile = provider.fetch_profile(&token.access_token).await?;
                    bus.publish_auth(
                        AuthPhase::Success,
                        format!("authenticated as {}", profile.username),
                    );
                    return Ok((token, profile));
                }
                Err(err) => {
                    bus.publish_auth(AuthPhase::Error, err.to_string());
                    return Err(err);
                }
            }
        }
    };
    match tokio::time::timeout(deadline, poll).await {
        Ok(result) => result,
        Err(_) => {
            bus.publish_auth(AuthPhase::Error, "device authorization timed out");
            Err(CoreError::Auth("device authorization timed out".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::config::CoreConfig;
    use crate::engine::{
        EngineSession, ProtocolEngine, ProtocolVersion, ServerTarget, SessionCredentials,
    };

    struct NullEngine;

    #[async_trait]
    impl ProtocolEngine for NullEngine {
        fn supported_versions(&self) -> Vec<ProtocolVersion> {
            Vec::new()
        }

        async fn open(
            &self,
            _target: ServerTarget,
            _version: &ProtocolVersion,
            _credentials: SessionCredentials,
        ) -> anyhow::Result<EngineSession> {
            anyhow::bail!("no sessions")
        }
    }

    struct NullProvider;

    #[async_trait]
    impl IdentityProvider for NullProvider {
        async fn begin_device_flow(&self) -> Result<DeviceAuthorization, CoreError> {
            Err(CoreError::Auth("unavailable".to_string()))
        }

        async fn poll_device_flow(&self, _device_code: &str) -> Result<DevicePoll, CoreError> {
            Err(CoreError::Auth("unavailable".to_string()))
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<ProviderToken, CoreError> {
            Err(CoreError::Auth("unavailable".to_string()))
        }

        async fn fetch_profile(&self, _access_token: &str) -> Result<Profile, CoreError> {
            Err(CoreError::Auth("unavailable".to_string()))
        }
    }

    fn core_in(dir: &tempfile::TempDir) -> Core {
        Core::open(
            CoreConfig {
                data_dir: dir.path().to_path_buf(),
                ..CoreConfig::default()
            },
            Arc::new(NullEngine),
            Arc::new(NullProvider),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn released_key_locks_are_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let core = core_in(&dir);

        drop(core.key_lock("alpha").await);
        drop(core.key_lock("beta").await);
        let held = core.key_lock("gamma").await;
        // Taking gamma pruned the two released keys.
        assert_eq!(core.key_locks.lock().len(), 1);

        let _other = core.key_lock("delta").await;
        // gamma's guard is still live, so it survives the prune.
        assert_eq!(core.key_locks.lock().len(), 2);
        drop(held);
    }
}

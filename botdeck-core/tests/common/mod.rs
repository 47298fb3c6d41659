//! Shared fixtures: an in-process protocol engine and identity provider.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use botdeck_core::{
    Core, CoreConfig, CoreError, DeviceAuthorization, DevicePoll, EngineSession, IdentityProvider,
    Profile, ProtocolEngine, ProtocolVersion, ProviderToken, ServerTarget, SessionCommand,
    SessionCredentials, SessionEvent,
};
use tokio::sync::mpsc;

/// Scripted engine: echoes chat back as events and honors protocol-level
/// disconnects (unless `stubborn`). Keeps an event-injection handle per
/// opened session so tests can simulate inbound server traffic.
#[derive(Default)]
pub struct FakeEngine {
    /// When set, sessions ignore `Disconnect` commands.
    pub stubborn: AtomicBool,
    /// When set, the next `open` fails and the flag clears.
    pub fail_next: AtomicBool,
    /// When set, sessions announce themselves dead the instant they open.
    pub drop_immediately: AtomicBool,
    /// Event senders for every session opened so far, oldest first.
    pub sessions: Mutex<Vec<mpsc::Sender<SessionEvent>>>,
}

impl FakeEngine {
    pub fn latest_session(&self) -> mpsc::Sender<SessionEvent> {
        self.sessions
            .lock()
            .unwrap()
            .last()
            .expect("no session opened")
            .clone()
    }
}

#[async_trait]
impl ProtocolEngine for FakeEngine {
    fn supported_versions(&self) -> Vec<ProtocolVersion> {
        vec!["1.20.4".into(), "1.21".into()]
    }

    async fn open(
        &self,
        _target: ServerTarget,
        _version: &ProtocolVersion,
        _credentials: SessionCredentials,
    ) -> anyhow::Result<EngineSession> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            anyhow::bail!("connection refused");
        }
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<SessionCommand>(16);
        let (evt_tx, evt_rx) = mpsc::channel::<SessionEvent>(16);
        let stubborn = self.stubborn.load(Ordering::SeqCst);
        let drop_immediately = self.drop_immediately.load(Ordering::SeqCst);
        let task_tx = evt_tx.clone();
        let task = tokio::spawn(async move {
            if drop_immediately {
                let _ = task_tx
                    .send(SessionEvent::StateChanged {
                        connected: false,
                        reason: Some("refused".to_string()),
                    })
                    .await;
                return;
            }
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    SessionCommand::Chat(text) => {
                        let _ = task_tx
                            .send(SessionEvent::ChatLine {
                                text: format!("echo: {text}"),
                            })
                            .await;
                    }
                    SessionCommand::Disconnect => {
                        if stubborn {
                            continue;
                        }
                        let _ = task_tx
                            .send(SessionEvent::StateChanged {
                                connected: false,
                                reason: Some("client quit".to_string()),
                            })
                            .await;
                        break;
                    }
                }
            }
        });
        self.sessions.lock().unwrap().push(evt_tx);
        Ok(EngineSession {
            commands: cmd_tx,
            events: evt_rx,
            abort: task.abort_handle(),
        })
    }
}

/// Scripted identity provider: a fixed authorization, a configurable number
/// of pending polls before the grant completes, and a canned profile.
pub struct FakeProvider {
    pub begin_calls: AtomicUsize,
    pub pending_polls: AtomicUsize,
    /// Artificial latency of `begin_device_flow`, to observe overlap.
    pub begin_delay: Duration,
    /// Poll interval handed out in the authorization, in seconds.
    pub interval: u64,
    /// `expires_in` of minted access tokens, in seconds.
    pub token_lifetime: u64,
    /// Profile behind minted tokens. `None` makes token validation fail.
    pub profile: Mutex<Option<Profile>>,
    pub refresh_ok: AtomicBool,
}

impl FakeProvider {
    pub fn with_profile(profile: Profile) -> Self {
        Self {
            begin_calls: AtomicUsize::new(0),
            pending_polls: AtomicUsize::new(0),
            begin_delay: Duration::ZERO,
            interval: 0,
            token_lifetime: 3600,
            profile: Mutex::new(Some(profile)),
            refresh_ok: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl IdentityProvider for FakeProvider {
    async fn begin_device_flow(&self) -> Result<DeviceAuthorization, CoreError> {
        self.begin_calls.fetch_add(1, Ordering::SeqCst);
        if !self.begin_delay.is_zero() {
            tokio::time::sleep(self.begin_delay).await;
        }
        Ok(DeviceAuthorization {
            verification_uri: "https://example.com/link".to_string(),
            user_code: "ABCD-1234".to_string(),
            device_code: "device-code-1".to_string(),
            expires_in: 300,
            interval: self.interval,
        })
    }

    async fn poll_device_flow(&self, _device_code: &str) -> Result<DevicePoll, CoreError> {
        if self.pending_polls.load(Ordering::SeqCst) > 0 {
            self.pending_polls.fetch_sub(1, Ordering::SeqCst);
            return Ok(DevicePoll::Pending);
        }
        Ok(DevicePoll::Complete(ProviderToken {
            access_token: "access-0".to_string(),
            refresh_token: Some("refresh-0".to_string()),
            expires_in: self.token_lifetime,
        }))
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<ProviderToken, CoreError> {
        if !self.refresh_ok.load(Ordering::SeqCst) {
            return Err(CoreError::Auth("refresh token revoked".to_string()));
        }
        Ok(ProviderToken {
            access_token: "access-refreshed".to_string(),
            refresh_token: Some("refresh-1".to_string()),
            expires_in: self.token_lifetime,
        })
    }

    async fn fetch_profile(&self, _access_token: &str) -> Result<Profile, CoreError> {
        match self.profile.lock().unwrap().clone() {
            Some(profile) => Ok(profile),
            None => Err(CoreError::Auth("token rejected upstream".to_string())),
        }
    }
}

pub fn online_profile(username: &str) -> Profile {
    Profile {
        uuid: uuid::Uuid::new_v4(),
        username: username.to_string(),
        skins: Some(vec![]),
        capes: Some(vec![]),
        authenticated: true,
    }
}

pub struct Harness {
    pub core: Core,
    pub engine: Arc<FakeEngine>,
    pub provider: Arc<FakeProvider>,
    pub dir: tempfile::TempDir,
}

pub fn harness() -> Harness {
    harness_with(
        FakeEngine::default(),
        FakeProvider::with_profile(online_profile("Herobrine")),
    )
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn harness_with(engine: FakeEngine, provider: FakeProvider) -> Harness {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(engine);
    let provider = Arc::new(provider);
    let config = CoreConfig {
        data_dir: dir.path().to_path_buf(),
        soft_kill_grace: Duration::from_millis(200),
        device_flow_timeout: Duration::from_secs(5),
    };
    let core = Core::open(config, engine.clone(), provider.clone()).unwrap();
    Harness {
        core,
        engine,
        provider,
        dir,
    }
}

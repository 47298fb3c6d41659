//! Host-side orchestration core for fleets of game-network bot sessions.
//!
//! A [`Core`] owns the client and server registries, the credential cache,
//! and every live session. Protocol work is delegated through the
//! [`engine::ProtocolEngine`] seam; identity work through the
//! [`auth::IdentityProvider`] seam. Observers watch the [`event::EventBus`]
//! for auth progress and per-connection traffic.
//!
//! Typical embedding:
//!
//! ```ignore
//! let core = Core::open(CoreConfig::default(), engine, provider)?;
//! let (client, profile) = core.authenticate_offline("steve")?;
//! core.add_server("hub", "mc.example.net", 25565)?;
//! let conn = core.create_connection(client, "hub", "1.21".into())?;
//! core.connect(client, conn).await?;
//! core.send_chat(client, conn, "hello").await?;
//! ```

pub mod auth;
pub mod config;
pub mod connection;
pub mod core;
pub mod engine;
pub mod error;
pub mod event;
pub mod profile;
pub mod registry;
pub mod store;

pub use crate::auth::{
    AuthCacheEntry, DeviceAuthorization, DevicePoll, HttpIdentityProvider, IdentityProvider,
    ProviderConfig, ProviderToken, VerificationHandle,
};
pub use crate::config::CoreConfig;
pub use crate::connection::{ConnectionState, InstanceSnapshot};
pub use crate::core::Core;
pub use crate::engine::{
    EngineSession, ProtocolEngine, ProtocolVersion, ServerTarget, SessionCommand,
    SessionCredentials, SessionEvent,
};
pub use crate::error::CoreError;
pub use crate::event::{AuthPhase, AuthProgress, ConnectionEvent, EventBus};
pub use crate::profile::Profile;
pub use crate::registry::{
    ClientId, ClientSummary, ConnectionId, IdentityKind, ServerEntry, ServerInfo,
};

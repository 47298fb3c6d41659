//! Error taxonomy for the orchestration core.
//!
//! Every command on [`crate::Core`] fails with a [`CoreError`]. No error is
//! process-fatal; each is scoped to the single command that raised it.
//! [`CoreError::CacheMiss`] is a recoverable signal, not a failure — callers
//! are expected to fall back to the device-code flow.

use thiserror::Error;

/// Errors surfaced by the core command surface.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed input (bad username, unsupported version, …).
    #[error("validation failed: {0}")]
    Validation(String),

    /// The identity provider rejected the request, or a token is
    /// invalid/expired beyond recovery.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// No credential cached under the given login key. Fall back to the
    /// device-code flow.
    #[error("no cached credential for login key '{0}'")]
    CacheMiss(String),

    /// A server with this name is already registered.
    #[error("server '{0}' already exists")]
    DuplicateServer(String),

    /// The client already has a live connection for this server/version pair.
    #[error("connection to '{server}' with version {version} already exists")]
    DuplicateConnection { server: String, version: String },

    /// The named server is not in the registry.
    #[error("server '{0}' not found")]
    UnknownServer(String),

    /// No client registered under the given id.
    #[error("client {0} not found")]
    UnknownClient(String),

    /// No connection with the given id on this client.
    #[error("connection {0} not found")]
    UnknownConnection(String),

    /// The operation requires a connected session.
    #[error("not connected: {0}")]
    NotConnected(String),

    /// Chat messages must not be blank.
    #[error("chat message is empty")]
    EmptyMessage,

    /// Session establishment failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// A registry document could not be read or written.
    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

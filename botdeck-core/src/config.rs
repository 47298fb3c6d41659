//! Core configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Tunables for the orchestration core.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Directory holding the registry documents
    /// (`clients.json`, `servers.json`, `auth_cache.json`).
    pub data_dir: PathBuf,
    /// How long a cooperative shutdown may take before it is escalated to a
    /// hard abort.
    pub soft_kill_grace: Duration,
    /// Upper bound on device-code polling. The provider's own expiry still
    /// applies; whichever is shorter wins.
    pub device_flow_timeout: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("botdeck"),
            soft_kill_grace: Duration::from_secs(8),
            device_flow_timeout: Duration::from_secs(90),
        }
    }
}

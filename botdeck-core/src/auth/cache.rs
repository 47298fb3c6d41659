//! Credential cache entries.
//!
//! The cache is keyed by a user-chosen login key, independent of the
//! account's real username. Entries are never auto-expired; validity is
//! checked on demand, and always re-checked across restarts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::profile::Profile;

/// One cached credential: a bearer token, its validity window, and the
/// profile it resolved to when it was minted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthCacheEntry {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub profile: Profile,
}

impl AuthCacheEntry {
    pub fn has_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

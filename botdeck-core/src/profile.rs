//! Player profiles and identity validation.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// Resolved identity data backing a client.
///
/// For authenticated identities this is the provider's view of the account
/// (id, name, cosmetics). Offline identities carry a deterministically
/// derived id and no cosmetics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Profile {
    pub uuid: Uuid,
    pub username: String,
    pub skins: Option<Vec<serde_json::Value>>,
    pub capes: Option<Vec<serde_json::Value>>,
    /// Whether this profile was resolved through the identity provider.
    pub authenticated: bool,
}

impl Profile {
    /// Derives an offline profile from a username.
    ///
    /// The id is a v3 UUID over `OfflinePlayer:<username>`, so the same
    /// username always yields the same profile id. Offline ids are advisory:
    /// servers derive their own for unauthenticated players.
    pub fn offline(username: &str) -> Result<Self, CoreError> {
        validate_username(username)?;
        let uuid = Uuid::new_v3(
            &Uuid::NAMESPACE_X500,
            format!("OfflinePlayer:{username}").as_bytes(),
        );
        tracing::debug!(%username, %uuid, "derived offline profile");
        Ok(Self {
            uuid,
            username: username.to_string(),
            skins: None,
            capes: None,
            authenticated: false,
        })
    }
}

/// Platform identity constraint: 3–16 characters from `[A-Za-z0-9_]`.
pub fn validate_username(username: &str) -> Result<(), CoreError> {
    if !(3..=16).contains(&username.len()) {
        return Err(CoreError::Validation(format!(
            "username must be 3-16 characters, got {}",
            username.len()
        )));
    }
    if let Some(bad) = username
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && *c != '_')
    {
        return Err(CoreError::Validation(format!(
            "username contains invalid character '{bad}'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offline_derivation_is_deterministic() {
        let a = Profile::offline("Steve").unwrap();
        let b = Profile::offline("Steve").unwrap();
        assert_eq!(a.uuid, b.uuid);
        assert_eq!(a.username, "Steve");
        assert!(!a.authenticated);
    }

    #[test]
    fn offline_derivation_differs_per_username() {
        let a = Profile::offline("Steve").unwrap();
        let b = Profile::offline("Alex").unwrap();
        assert_ne!(a.uuid, b.uuid);
    }

    #[test]
    fn username_length_bounds() {
        assert!(validate_username("ab").is_err());
        assert!(validate_username("abc").is_ok());
        assert!(validate_username("a_very_long_name").is_ok()); // 16 chars
        assert!(validate_username("a_very_long_name2").is_err()); // 17 chars
    }

    #[test]
    fn username_charset() {
        assert!(validate_username("Steve_123").is_ok());
        assert!(validate_username("Steve-123").is_err());
        assert!(validate_username("Stève").is_err());
    }
}

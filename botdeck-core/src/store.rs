//! JSON document persistence.
//!
//! The core owns three durable documents under one data directory: the
//! client registry, the server registry, and the credential cache. Each is
//! loaded wholesale at startup and rewritten wholesale on mutation. The
//! credential cache holds live bearer tokens, so it is written with
//! owner-only permissions on Unix.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::CoreError;

pub const CLIENTS_DOC: &str = "clients.json";
pub const SERVERS_DOC: &str = "servers.json";
pub const AUTH_CACHE_DOC: &str = "auth_cache.json";

/// Handle on the data directory holding the registry documents.
pub struct Store {
    dir: PathBuf,
}

impl Store {
    /// Opens (creating if needed) the data directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        tracing::info!(dir = %dir.display(), "opened document store");
        Ok(Self { dir })
    }

    pub fn path(&self, doc: &str) -> PathBuf {
        self.dir.join(doc)
    }

    /// Loads a document, or its `Default` if the file does not exist yet.
    /// A present-but-unparseable document is a hard persistence error; we do
    /// not silently discard registries.
    pub fn load<T>(&self, doc: &str) -> Result<T, CoreError>
    where
        T: DeserializeOwned + Default,
    {
        let path = self.path(doc);
        if !path.exists() {
            return Ok(T::default());
        }
        let raw = fs::read_to_string(&path)?;
        serde_json::from_str(&raw).map_err(|e| {
            CoreError::Persistence(format!("failed to parse {doc}: {e}"))
        })
    }

    /// Rewrites a document in full.
    pub fn save<T: Serialize>(&self, doc: &str, value: &T) -> Result<(), CoreError> {
        let json = serde_json::to_string_pretty(value)?;
        fs::write(self.path(doc), json)?;
        tracing::debug!(doc, "document saved");
        Ok(())
    }

    /// Like [`Store::save`] but restricts the file to the owning user.
    /// Used for the credential cache, which contains bearer tokens.
    pub fn save_sensitive<T: Serialize>(&self, doc: &str, value: &T) -> Result<(), CoreError> {
        self.save(doc, value)?;
        restrict_permissions(&self.path(doc))?;
        Ok(())
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), CoreError> {
    use std::os::unix::fs::PermissionsExt;
    let perms = fs::Permissions::from_mode(0o600);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), CoreError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn missing_document_loads_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let doc: HashMap<String, u32> = store.load("nothing.json").unwrap();
        assert!(doc.is_empty());
    }

    #[test]
    fn save_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let mut doc = HashMap::new();
        doc.insert("hub".to_string(), 25565u32);
        store.save("servers.json", &doc).unwrap();
        let loaded: HashMap<String, u32> = store.load("servers.json").unwrap();
        assert_eq!(loaded, doc);
    }

    #[test]
    fn corrupt_document_is_a_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        fs::write(store.path("clients.json"), "{not json").unwrap();
        let res: Result<HashMap<String, u32>, _> = store.load("clients.json");
        assert!(matches!(res, Err(CoreError::Persistence(_))));
    }

    #[cfg(unix)]
    #[test]
    fn sensitive_documents_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store
            .save_sensitive("auth_cache.json", &HashMap::<String, String>::new())
            .unwrap();
        let mode = fs::metadata(store.path("auth_cache.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}

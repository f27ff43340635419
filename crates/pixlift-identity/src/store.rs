//! Durable storage for the resolved identity
//!
//! One small document per installation: the current device id plus the
//! signed-in principal, if any. The file-backed store writes through a
//! temp file and rename so a crash mid-save never leaves a torn document.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::IdentityResult;

/// The durable identity document for an installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedIdentity {
    /// Device id of the underlying anonymous identity. Kept while signed
    /// in so the sign-in transition can name the identity it replaced.
    pub device_id: String,
    /// Principal id of the signed-in account, if any
    pub principal_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PersistedIdentity {
    /// Creates a first-run document for the given device id.
    pub fn new(device_id: String) -> Self {
        let now = Utc::now();
        PersistedIdentity {
            device_id,
            principal_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Storage backend for the identity document
pub trait IdentityStore: Send + Sync {
    /// Loads the stored document, or `None` on first run.
    fn load(&self) -> IdentityResult<Option<PersistedIdentity>>;

    /// Persists the document, replacing any previous one.
    fn save(&self, identity: &PersistedIdentity) -> IdentityResult<()>;
}

/// File-backed identity store holding a single JSON document
pub struct FileIdentityStore {
    path: PathBuf,
}

impl FileIdentityStore {
    /// Creates a store rooted at `dir`, creating the directory if needed.
    pub fn new(dir: impl AsRef<Path>) -> IdentityResult<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        Ok(FileIdentityStore {
            path: dir.join("identity.json"),
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl IdentityStore for FileIdentityStore {
    fn load(&self) -> IdentityResult<Option<PersistedIdentity>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(&self.path)?;
        let identity = serde_json::from_str(&data)?;
        Ok(Some(identity))
    }

    fn save(&self, identity: &PersistedIdentity) -> IdentityResult<()> {
        let json = serde_json::to_string_pretty(identity)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// In-memory identity store for tests and ephemeral sessions
#[derive(Default)]
pub struct MemoryIdentityStore {
    inner: RwLock<Option<PersistedIdentity>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn load(&self) -> IdentityResult<Option<PersistedIdentity>> {
        Ok(self.inner.read().clone())
    }

    fn save(&self, identity: &PersistedIdentity) -> IdentityResult<()> {
        *self.inner.write() = Some(identity.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "pixlift_identity_{}_{}",
            tag,
            crate::generate_device_id()
        ))
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = temp_dir("round_trip");
        let store = FileIdentityStore::new(&dir).unwrap();
        assert!(store.load().unwrap().is_none());

        let mut doc = PersistedIdentity::new("device-1".to_string());
        store.save(&doc).unwrap();
        assert_eq!(store.load().unwrap(), Some(doc.clone()));

        doc.principal_id = Some("user-1".to_string());
        store.save(&doc).unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.principal_id.as_deref(), Some("user-1"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_file_store_leaves_no_temp_file() {
        let dir = temp_dir("tmp_file");
        let store = FileIdentityStore::new(&dir).unwrap();
        store
            .save(&PersistedIdentity::new("device-2".to_string()))
            .unwrap();
        assert!(store.path().exists());
        assert!(!store.path().with_extension("json.tmp").exists());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemoryIdentityStore::new();
        assert!(store.load().unwrap().is_none());
        let doc = PersistedIdentity::new("device-3".to_string());
        store.save(&doc).unwrap();
        assert_eq!(store.load().unwrap(), Some(doc));
    }
}

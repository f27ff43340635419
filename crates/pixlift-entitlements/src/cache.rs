//! Device-local balance cache
//!
//! The cache is the synchronous, offline-readable side of the system:
//! one record per identity, no network, last write wins. It is a
//! projection of the remote ledger and never the authority; the engine
//! only writes it from values the ledger returned (or from locally
//! seeded records that the next successful load reconciles).

use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use dashmap::DashMap;

use pixlift_identity::Identity;

use crate::balance::BalanceRecord;
use crate::error::EntitlementResult;

/// Synchronous store for the local copy of each identity's balance
pub trait BalanceCache: Send + Sync {
    /// Loads the cached record, or `None` when the identity is unknown.
    fn load(&self, identity: &Identity) -> EntitlementResult<Option<BalanceRecord>>;

    /// Overwrites the cached record for `identity`.
    fn save(&self, identity: &Identity, record: &BalanceRecord) -> EntitlementResult<()>;

    /// Drops the cached record for `identity`, if any.
    fn clear(&self, identity: &Identity) -> EntitlementResult<()>;
}

/// In-memory cache for tests and ephemeral sessions
#[derive(Default)]
pub struct MemoryCache {
    records: DashMap<String, BalanceRecord>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BalanceCache for MemoryCache {
    fn load(&self, identity: &Identity) -> EntitlementResult<Option<BalanceRecord>> {
        Ok(self
            .records
            .get(&identity.storage_key())
            .map(|record| record.clone()))
    }

    fn save(&self, identity: &Identity, record: &BalanceRecord) -> EntitlementResult<()> {
        self.records.insert(identity.storage_key(), record.clone());
        Ok(())
    }

    fn clear(&self, identity: &Identity) -> EntitlementResult<()> {
        self.records.remove(&identity.storage_key());
        Ok(())
    }
}

/// File-backed cache writing one JSON document per identity.
///
/// Documents are human-readable on purpose; a support engineer can open
/// the cache directory and read the device's view of a balance directly.
pub struct FileCache {
    base_dir: PathBuf,
}

impl FileCache {
    /// Creates a cache rooted at `base_dir`, creating it if needed.
    pub fn new(base_dir: impl AsRef<Path>) -> EntitlementResult<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir)?;
        Ok(FileCache { base_dir })
    }

    /// File path for an identity: the sanitized storage key plus a hash
    /// suffix, so distinct keys can never share a file.
    fn record_path(&self, identity: &Identity) -> PathBuf {
        let key = identity.storage_key();
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let sanitized: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.base_dir
            .join(format!("{}_{:016x}.json", sanitized, hasher.finish()))
    }
}

impl BalanceCache for FileCache {
    fn load(&self, identity: &Identity) -> EntitlementResult<Option<BalanceRecord>> {
        let path = self.record_path(identity);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(&path)?;
        let record = serde_json::from_str(&data)?;
        Ok(Some(record))
    }

    fn save(&self, identity: &Identity, record: &BalanceRecord) -> EntitlementResult<()> {
        let json = serde_json::to_string_pretty(record)?;
        let path = self.record_path(identity);
        // Write-then-rename keeps a crash from leaving a torn document.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn clear(&self, identity: &Identity) -> EntitlementResult<()> {
        let path = self.record_path(identity);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::QuotaLimit;
    use chrono::NaiveDate;

    fn record_for(identity: &Identity, credits: u64) -> BalanceRecord {
        BalanceRecord::new(
            identity.storage_key(),
            credits,
            QuotaLimit::Limited(25),
            NaiveDate::parse_from_str("2024-06-01", "%Y-%m-%d").unwrap(),
        )
    }

    fn temp_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "pixlift_cache_{}_{}",
            tag,
            pixlift_identity::generate_device_id()
        ))
    }

    #[test]
    fn test_memory_cache_round_trip() {
        let cache = MemoryCache::new();
        let identity = Identity::new_anonymous();
        assert!(cache.load(&identity).unwrap().is_none());

        let record = record_for(&identity, 7);
        cache.save(&identity, &record).unwrap();
        assert_eq!(cache.load(&identity).unwrap(), Some(record));

        cache.clear(&identity).unwrap();
        assert!(cache.load(&identity).unwrap().is_none());
    }

    #[test]
    fn test_file_cache_round_trip() {
        let dir = temp_dir("round_trip");
        let cache = FileCache::new(&dir).unwrap();
        let identity = Identity::new_anonymous();
        assert!(cache.load(&identity).unwrap().is_none());

        let record = record_for(&identity, 12);
        cache.save(&identity, &record).unwrap();
        assert_eq!(cache.load(&identity).unwrap(), Some(record.clone()));

        // Overwrite wins.
        let mut updated = record;
        updated.credits = 11;
        cache.save(&identity, &updated).unwrap();
        assert_eq!(cache.load(&identity).unwrap().unwrap().credits, 11);

        cache.clear(&identity).unwrap();
        assert!(cache.load(&identity).unwrap().is_none());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_file_cache_keeps_identities_apart() {
        let dir = temp_dir("apart");
        let cache = FileCache::new(&dir).unwrap();
        let anon = Identity::Anonymous {
            device_id: "same".to_string(),
        };
        let auth = Identity::Authenticated {
            principal_id: "same".to_string(),
        };

        cache.save(&anon, &record_for(&anon, 1)).unwrap();
        cache.save(&auth, &record_for(&auth, 2)).unwrap();

        assert_eq!(cache.load(&anon).unwrap().unwrap().credits, 1);
        assert_eq!(cache.load(&auth).unwrap().unwrap().credits, 2);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_file_cache_leaves_no_temp_file() {
        let dir = temp_dir("tmp");
        let cache = FileCache::new(&dir).unwrap();
        let identity = Identity::new_anonymous();
        cache.save(&identity, &record_for(&identity, 3)).unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .path()
                    .extension()
                    .map(|ext| ext == "tmp")
                    .unwrap_or(false)
            })
            .collect();
        assert!(leftovers.is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }
}

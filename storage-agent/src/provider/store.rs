//! Directory-backed store of resource provider configs.
//!
//! One JSON file per provider identity. Every mutation writes a temporary
//! file next to the target, syncs it, and renames it into place, so a reader
//! (or a restarted agent) sees either the old or the new config, never a
//! partial one.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::info::{ProviderKey, ResourceProviderInfo};
use super::validator::{self, ValidationError};

const CONFIG_EXTENSION: &str = "json";
const TEMP_PREFIX: &str = ".";
const TEMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("resource provider config {0} already exists")]
    Conflict(ProviderKey),

    #[error("resource provider config {0} not found")]
    NotFound(ProviderKey),

    #[error("failed to decode '{path}': {source}")]
    Decode {
        path: String,
        source: serde_json::Error,
    },

    #[error("invalid config '{path}': {source}")]
    Invalid {
        path: String,
        source: ValidationError,
    },

    #[error("'{first}' and '{second}' both configure {key}")]
    Duplicate {
        key: ProviderKey,
        first: String,
        second: String,
    },

    #[error("failed to encode config: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A config together with the file it lives in.
#[derive(Debug, Clone)]
pub struct StoredConfig {
    pub path: PathBuf,
    pub info: ResourceProviderInfo,
}

#[derive(Debug)]
pub struct ConfigStore {
    dir: PathBuf,
    index: RwLock<HashMap<ProviderKey, StoredConfig>>,
}

impl ConfigStore {
    /// Open the store rooted at `dir`, creating the directory if needed and
    /// loading every config in it.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let index = scan(&dir)?;
        info!(
            dir = %dir.display(),
            count = index.len(),
            "Loaded resource provider configs"
        );

        Ok(Self {
            dir,
            index: RwLock::new(index),
        })
    }

    /// All stored configs, ordered by identity.
    pub fn list(&self) -> Vec<ResourceProviderInfo> {
        let index = self.read();
        let mut configs: Vec<_> = index.values().map(|c| c.info.clone()).collect();
        configs.sort_by_key(|info| info.key());
        configs
    }

    /// Store a new config. Fails with `Conflict` if the identity is taken.
    #[instrument(skip(self, info), fields(key = %info.key()))]
    pub fn create(&self, info: &ResourceProviderInfo) -> Result<PathBuf> {
        let key = info.key();
        let mut index = self.write();
        if index.contains_key(&key) {
            return Err(StoreError::Conflict(key));
        }

        let path = self.dir.join(file_name_for(&key));
        self.write_file(&path, info, true).map_err(|e| match e {
            StoreError::Io(io) if io.kind() == io::ErrorKind::AlreadyExists => {
                StoreError::Conflict(key.clone())
            }
            other => other,
        })?;

        info!(path = %path.display(), "Created resource provider config");
        index.insert(
            key,
            StoredConfig {
                path: path.clone(),
                info: info.clone(),
            },
        );
        Ok(path)
    }

    /// Rewrite the file of an existing config. Fails with `NotFound` if the
    /// identity is unknown.
    #[instrument(skip(self, info), fields(key = %info.key()))]
    pub fn replace(&self, info: &ResourceProviderInfo) -> Result<PathBuf> {
        let key = info.key();
        let mut index = self.write();
        let stored = index.get_mut(&key).ok_or(StoreError::NotFound(key))?;

        self.write_file(&stored.path, info, false)?;
        stored.info = info.clone();

        info!(path = %stored.path.display(), "Replaced resource provider config");
        Ok(stored.path.clone())
    }

    /// Delete a config, returning what was stored.
    #[instrument(skip(self), fields(key = %key))]
    pub fn delete(&self, key: &ProviderKey) -> Result<ResourceProviderInfo> {
        let mut index = self.write();
        let path = match index.get(key) {
            Some(stored) => stored.path.clone(),
            None => return Err(StoreError::NotFound(key.clone())),
        };

        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Config file already gone");
            }
            Err(e) => return Err(e.into()),
        }
        sync_dir(&self.dir)?;

        info!(path = %path.display(), "Deleted resource provider config");
        let stored = index.remove(key).ok_or_else(|| StoreError::NotFound(key.clone()))?;
        Ok(stored.info)
    }

    fn write_file(&self, path: &Path, info: &ResourceProviderInfo, noclobber: bool) -> Result<()> {
        let mut content = serde_json::to_vec_pretty(info).map_err(StoreError::Encode)?;
        content.push(b'\n');

        let mut temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(TEMP_SUFFIX)
            .tempfile_in(&self.dir)?;
        temp.write_all(&content)?;
        temp.as_file().sync_all()?;

        // A failed persist drops the temporary file.
        if noclobber {
            temp.persist_noclobber(path).map_err(|e| e.error)?;
        } else {
            temp.persist(path).map_err(|e| e.error)?;
        }
        sync_dir(&self.dir)?;

        debug!(path = %path.display(), bytes = content.len(), "Wrote config file");
        Ok(())
    }

    // A poisoned lock only means a panic elsewhere; the index itself is
    // updated after the file operation succeeds, so it is still consistent.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<ProviderKey, StoredConfig>> {
        self.index.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ProviderKey, StoredConfig>> {
        self.index.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// File name used for configs created through the store:
/// `<sanitized name>-<8 hex digits>.json`.
pub fn file_name_for(key: &ProviderKey) -> String {
    let sanitized: String = key
        .name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();

    let mut hasher = Sha256::new();
    hasher.update(key.provider_type.as_bytes());
    hasher.update([0u8]);
    hasher.update(key.name.as_bytes());
    let digest = hasher.finalize();

    format!(
        "{}-{}.{}",
        sanitized.trim_start_matches('.'),
        hex::encode(&digest[..4]),
        CONFIG_EXTENSION
    )
}

fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

fn scan(dir: &Path) -> Result<HashMap<ProviderKey, StoredConfig>> {
    let mut index: HashMap<ProviderKey, StoredConfig> = HashMap::new();

    let mut entries = fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let file_name = entry.file_name().to_string_lossy().into_owned();

        if file_name.starts_with(TEMP_PREFIX) {
            if file_name.ends_with(TEMP_SUFFIX) {
                warn!(path = %path.display(), "Removing leftover of interrupted write");
                fs::remove_file(&path)?;
            }
            continue;
        }
        if !entry.file_type()?.is_file()
            || path.extension().and_then(|e| e.to_str()) != Some(CONFIG_EXTENSION)
        {
            debug!(path = %path.display(), "Skipping non-config entry");
            continue;
        }

        let content = fs::read(&path)?;
        let info: ResourceProviderInfo =
            serde_json::from_slice(&content).map_err(|source| StoreError::Decode {
                path: path.display().to_string(),
                source,
            })?;
        validator::validate(&info).map_err(|source| StoreError::Invalid {
            path: path.display().to_string(),
            source,
        })?;

        let key = info.key();
        if let Some(existing) = index.get(&key) {
            return Err(StoreError::Duplicate {
                key,
                first: existing.path.display().to_string(),
                second: path.display().to_string(),
            });
        }

        debug!(path = %path.display(), key = %key, "Loaded config");
        index.insert(key, StoredConfig { path, info });
    }

    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::info::tests::storage_provider;
    use tempfile::TempDir;

    fn config_files(dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<_> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        files.sort();
        files
    }

    #[test]
    fn test_create_then_list() {
        let temp = TempDir::new().unwrap();
        let store = ConfigStore::open(temp.path()).unwrap();
        let info = storage_provider("test", "/bin/plugin", "volume1:4GB");

        let path = store.create(&info).unwrap();

        assert_eq!(store.list(), vec![info.clone()]);
        assert_eq!(config_files(temp.path()), vec![path.clone()]);
        assert!(path.file_name().unwrap().to_str().unwrap().starts_with("test-"));

        let reopened = ConfigStore::open(temp.path()).unwrap();
        assert_eq!(reopened.get(&info.key()), Some(info));
    }

    #[test]
    fn test_create_conflict_leaves_file_untouched() {
        let temp = TempDir::new().unwrap();
        let store = ConfigStore::open(temp.path()).unwrap();
        let info = storage_provider("test", "/bin/plugin", "volume1:4GB");
        let path = store.create(&info).unwrap();
        let before = fs::read(&path).unwrap();

        let changed = storage_provider("test", "/bin/other", "volume1:2GB");
        assert!(matches!(store.create(&changed), Err(StoreError::Conflict(_))));
        assert_eq!(fs::read(&path).unwrap(), before);
        assert_eq!(config_files(temp.path()).len(), 1);
    }

    #[test]
    fn test_replace_keeps_operator_file_name() {
        let temp = TempDir::new().unwrap();
        let info = storage_provider("test", "/bin/plugin", "volume1:4GB");
        let operator_path = temp.path().join("test.json");
        fs::write(&operator_path, serde_json::to_vec(&info).unwrap()).unwrap();

        let store = ConfigStore::open(temp.path()).unwrap();
        assert_eq!(store.list(), vec![info.clone()]);

        let updated = storage_provider("test", "/bin/plugin", "volume1:2GB");
        assert_eq!(store.replace(&updated).unwrap(), operator_path);
        assert_eq!(config_files(temp.path()), vec![operator_path.clone()]);

        let on_disk: ResourceProviderInfo =
            serde_json::from_slice(&fs::read(&operator_path).unwrap()).unwrap();
        assert_eq!(on_disk, updated);
    }

    #[test]
    fn test_replace_and_delete_missing() {
        let temp = TempDir::new().unwrap();
        let store = ConfigStore::open(temp.path()).unwrap();
        let info = storage_provider("test", "/bin/plugin", "volume1:4GB");

        assert!(matches!(store.replace(&info), Err(StoreError::NotFound(_))));
        assert!(matches!(store.delete(&info.key()), Err(StoreError::NotFound(_))));
        assert!(config_files(temp.path()).is_empty());
    }

    #[test]
    fn test_delete_removes_file() {
        let temp = TempDir::new().unwrap();
        let store = ConfigStore::open(temp.path()).unwrap();
        let info = storage_provider("test", "/bin/plugin", "volume1:4GB");
        store.create(&info).unwrap();

        assert_eq!(store.delete(&info.key()).unwrap(), info);
        assert!(store.list().is_empty());
        assert!(config_files(temp.path()).is_empty());

        // The identity is free again.
        store.create(&info).unwrap();
    }

    #[test]
    fn test_open_cleans_temp_files_and_skips_others() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(".abc123.tmp"), "{ partial").unwrap();
        fs::write(temp.path().join("README"), "not a config").unwrap();
        fs::create_dir(temp.path().join("subdir.json")).unwrap();

        let store = ConfigStore::open(temp.path()).unwrap();
        assert!(store.list().is_empty());
        assert!(!temp.path().join(".abc123.tmp").exists());
        assert!(temp.path().join("README").exists());
    }

    #[test]
    fn test_open_rejects_corrupt_and_duplicate_files() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("broken.json"), "{ not json").unwrap();
        assert!(matches!(
            ConfigStore::open(temp.path()),
            Err(StoreError::Decode { .. })
        ));

        let temp = TempDir::new().unwrap();
        let info = storage_provider("test", "/bin/plugin", "volume1:4GB");
        let json = serde_json::to_vec(&info).unwrap();
        fs::write(temp.path().join("a.json"), &json).unwrap();
        fs::write(temp.path().join("b.json"), &json).unwrap();
        assert!(matches!(
            ConfigStore::open(temp.path()),
            Err(StoreError::Duplicate { .. })
        ));
    }

    #[test]
    fn test_file_name_is_stable_and_distinct() {
        let a = ProviderKey::new("org.apache.mesos.rp.local.storage", "test");
        let b = ProviderKey::new("org.apache.mesos.rp.local.other", "test");
        assert_eq!(file_name_for(&a), file_name_for(&a));
        assert_ne!(file_name_for(&a), file_name_for(&b));
        assert!(file_name_for(&a).ends_with(".json"));
    }
}

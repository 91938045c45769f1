//! Versioned JSON persistence under `<config>/.storage/`
//!
//! Every file has the envelope
//!
//! ```json
//! { "version": 1, "minor_version": 1, "key": "core.entity_registry", "data": { } }
//! ```
//!
//! and is written to a temporary file first, then renamed into place.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

/// Errors reading, writing or migrating a storage file
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Stored major version is older and the type has no migration
    #[error("Migration required for {key}: from {from} to {to}")]
    MigrationRequired { key: String, from: u32, to: u32 },

    /// A migration ran but could not convert the data
    #[error("Migration of {key} failed: {message}")]
    MigrationFailed { key: String, message: String },
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// On-disk envelope around the stored data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageFile<T> {
    /// Major version, a change requires [`Storable::migrate`]
    pub version: u32,
    /// Minor version, readable by older code
    #[serde(default = "default_minor_version")]
    pub minor_version: u32,
    pub key: String,
    pub data: T,
}

fn default_minor_version() -> u32 {
    1
}

impl<T> StorageFile<T> {
    pub fn new(key: impl Into<String>, data: T, version: u32, minor_version: u32) -> Self {
        Self {
            version,
            minor_version,
            key: key.into(),
            data,
        }
    }
}

/// Handle on the `.storage/` directory
#[derive(Debug, Clone)]
pub struct Storage {
    storage_dir: PathBuf,
}

impl Storage {
    /// Storage rooted at `<config_dir>/.storage`
    pub fn new(config_dir: impl AsRef<Path>) -> Self {
        Self {
            storage_dir: config_dir.as_ref().join(".storage"),
        }
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// Path of the file for a key; keys are file names
    pub fn file_path(&self, key: &str) -> PathBuf {
        self.storage_dir.join(key)
    }

    pub async fn exists(&self, key: &str) -> bool {
        fs::try_exists(self.file_path(key)).await.unwrap_or(false)
    }

    /// Read the raw file contents, `None` when the file does not exist
    async fn read(&self, key: &str) -> StorageResult<Option<String>> {
        match fs::read_to_string(self.file_path(key)).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(key, "Storage file not found");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read and parse a file, `None` when it does not exist
    pub async fn load<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> StorageResult<Option<StorageFile<T>>> {
        let Some(content) = self.read(key).await? else {
            return Ok(None);
        };
        let file: StorageFile<T> = serde_json::from_str(&content)?;
        debug!(key, version = file.version, minor = file.minor_version, "Loaded storage file");
        Ok(Some(file))
    }

    /// Write atomically through a `.tmp` file and a rename
    pub async fn save<T: Serialize>(&self, file: &StorageFile<T>) -> StorageResult<()> {
        fs::create_dir_all(&self.storage_dir).await?;

        let path = self.file_path(&file.key);
        let temp_path = self.file_path(&format!("{}.tmp", file.key));

        let content = serde_json::to_string_pretty(file)?;
        fs::write(&temp_path, &content).await?;
        fs::rename(&temp_path, &path).await?;

        debug!(key = %file.key, version = file.version, "Saved storage file");
        Ok(())
    }

    /// Remove a file; a missing file is not an error
    pub async fn delete(&self, key: &str) -> StorageResult<()> {
        match fs::remove_file(self.file_path(key)).await {
            Ok(()) => {
                debug!(key, "Deleted storage file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Types persisted as one storage file
pub trait Storable: Serialize + DeserializeOwned + Send + Sync {
    /// File name under `.storage/`, e.g. `core.entity_registry`
    const KEY: &'static str;
    const VERSION: u32;
    const MINOR_VERSION: u32 = 1;

    /// Upgrade data written with an older major version
    ///
    /// The default fails with [`StorageError::MigrationRequired`].
    fn migrate(data: serde_json::Value, from_version: u32) -> StorageResult<Self> {
        let _ = data;
        Err(StorageError::MigrationRequired {
            key: Self::KEY.to_string(),
            from: from_version,
            to: Self::VERSION,
        })
    }
}

/// Typed view of one storage file
#[derive(Debug, Clone)]
pub struct Store<T> {
    storage: Storage,
    _marker: PhantomData<T>,
}

impl<T: Storable> Store<T> {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            _marker: PhantomData,
        }
    }

    pub fn key(&self) -> &'static str {
        T::KEY
    }

    /// Load and, if needed, migrate the stored data
    pub async fn load(&self) -> StorageResult<Option<T>> {
        let Some(content) = self.storage.read(T::KEY).await? else {
            return Ok(None);
        };

        let raw: StorageFile<serde_json::Value> = serde_json::from_str(&content)?;

        if raw.version > T::VERSION {
            return Err(StorageError::MigrationFailed {
                key: T::KEY.to_string(),
                message: format!(
                    "stored version {} is newer than supported version {}",
                    raw.version,
                    T::VERSION
                ),
            });
        }

        if raw.version < T::VERSION {
            info!(key = T::KEY, from = raw.version, to = T::VERSION, "Migrating storage");
            return T::migrate(raw.data, raw.version).map(Some);
        }

        if raw.minor_version < T::MINOR_VERSION {
            warn!(
                key = T::KEY,
                stored = raw.minor_version,
                current = T::MINOR_VERSION,
                "Storage has an older minor version"
            );
        }

        Ok(Some(serde_json::from_value(raw.data)?))
    }

    pub async fn save(&self, data: &T) -> StorageResult<()> {
        self.storage
            .save(&StorageFile::new(T::KEY, data, T::VERSION, T::MINOR_VERSION))
            .await
    }

    pub async fn remove(&self) -> StorageResult<()> {
        self.storage.delete(T::KEY).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Counters {
        name: String,
        value: i32,
    }

    impl Storable for Counters {
        const KEY: &'static str = "test.counters";
        const VERSION: u32 = 2;

        fn migrate(data: serde_json::Value, from_version: u32) -> StorageResult<Self> {
            // Version 1 stored a bare number
            match (from_version, data.as_i64()) {
                (1, Some(value)) => Ok(Counters {
                    name: "migrated".to_string(),
                    value: value as i32,
                }),
                _ => Err(StorageError::MigrationFailed {
                    key: Self::KEY.to_string(),
                    message: "unexpected data".to_string(),
                }),
            }
        }
    }

    #[tokio::test]
    async fn test_store_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let store: Store<Counters> = Store::new(Storage::new(temp_dir.path()));

        assert_eq!(store.load().await.unwrap(), None);

        let data = Counters {
            name: "energy".to_string(),
            value: 42,
        };
        store.save(&data).await.unwrap();

        let raw = std::fs::read_to_string(temp_dir.path().join(".storage/test.counters")).unwrap();
        let raw: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(raw["version"], 2);
        assert_eq!(raw["key"], "test.counters");
        assert!(!temp_dir.path().join(".storage/test.counters.tmp").exists());

        assert_eq!(store.load().await.unwrap(), Some(data));
    }

    #[tokio::test]
    async fn test_store_migrates_older_versions() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new(temp_dir.path());
        storage
            .save(&StorageFile::new("test.counters", json!(7), 1, 1))
            .await
            .unwrap();

        let store: Store<Counters> = Store::new(storage);
        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.name, "migrated");
        assert_eq!(loaded.value, 7);
    }

    #[tokio::test]
    async fn test_store_refuses_newer_versions() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new(temp_dir.path());
        storage
            .save(&StorageFile::new("test.counters", json!({}), 9, 1))
            .await
            .unwrap();

        let store: Store<Counters> = Store::new(storage);
        assert!(matches!(
            store.load().await,
            Err(StorageError::MigrationFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_missing_file_is_ok() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new(temp_dir.path());
        storage.delete("nothing").await.unwrap();
        assert!(!storage.exists("nothing").await);
    }
}

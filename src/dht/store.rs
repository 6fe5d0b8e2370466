//! Peer store module
//!
//! Key-value capability the DHT persists known peers through, with an
//! in-memory implementation and a JSON-file implementation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, error};

use crate::error::P2pError;

/// Thread-safe string key-value store
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn put(&self, key: &str, value: &str) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Every pair whose key starts with `prefix`, in key order
    async fn range(&self, prefix: &str) -> Result<Vec<(String, String)>>;
}

fn range_of(map: &BTreeMap<String, String>, prefix: &str) -> Vec<(String, String)> {
    map.range(prefix.to_string()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Volatile store
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.entries.write().await.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn range(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        Ok(range_of(&*self.entries.read().await, prefix))
    }
}

/// Store backed by one JSON object on disk, rewritten on every mutation
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, String>>,
}

impl FileStore {
    /// Open `path`, starting empty if it does not exist
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = if fs::try_exists(&path).await.unwrap_or(false) {
            let data = fs::read(&path).await.map_err(|e| {
                error!("Failed to read store {}: {}", path.display(), e);
                P2pError::config_error_with_field(format!("Failed to read store: {}", e), path.display().to_string())
            })?;
            if data.is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_slice(&data)?
            }
        } else {
            BTreeMap::new()
        };
        debug!("Opened store {} with {} entries", path.display(), entries.len());

        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let data = serde_json::to_vec_pretty(entries)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, data).await?;
        fs::rename(&tmp, &self.path).await.map_err(|e| {
            error!("Failed to write store {}: {}", self.path.display(), e);
            e
        })?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for FileStore {
    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        if entries.get(key).map(String::as_str) == Some(value) {
            return Ok(());
        }
        entries.insert(key.to_string(), value.to_string());
        self.flush(&entries).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        if entries.remove(key).is_some() {
            self.flush(&entries).await?;
        }
        Ok(())
    }

    async fn range(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        Ok(range_of(&*self.entries.read().await, prefix))
    }
}

//! JSON-file backend.
//!
//! DESIGN
//! ======
//! The whole store is one JSON object on disk, mirrored in memory. Reads
//! never touch the file. Every mutation rewrites the file through a
//! sibling temp file and a rename, so a crash mid-write leaves either the
//! old or the new store, never a truncated one.
//!
//! A second process writing the same file is not coordinated with; changes
//! it makes become visible only after [`FileBackend::reload`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use super::{BackendError, StorageBackend};

#[derive(Clone)]
pub struct FileBackend {
    path: PathBuf,
    entries: Arc<Mutex<BTreeMap<String, String>>>,
}

impl FileBackend {
    /// Open the store at `path`, creating an empty one if the file is absent.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Io`] if the file cannot be read and
    /// [`BackendError::Corrupt`] if it is not a JSON object of strings.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        let path = path.as_ref().to_path_buf();
        let entries = load_entries(&path).await?;
        info!(path = %path.display(), entries = entries.len(), "file store opened");
        Ok(Self { path, entries: Arc::new(Mutex::new(entries)) })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the file, picking up writes made by other processes.
    ///
    /// # Errors
    ///
    /// Same as [`FileBackend::open`].
    pub async fn reload(&self) -> Result<(), BackendError> {
        let fresh = load_entries(&self.path).await?;
        *self.entries.lock().await = fresh;
        Ok(())
    }

    async fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), BackendError> {
        let body = serde_json::to_vec_pretty(entries).map_err(|e| BackendError::Corrupt(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

async fn load_entries(path: &Path) -> Result<BTreeMap<String, String>, BackendError> {
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.is_empty() => Ok(BTreeMap::new()),
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| BackendError::Corrupt(e.to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(BackendError::Io(e)),
    }
}

#[async_trait::async_trait]
impl StorageBackend for FileBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), BackendError> {
        let mut entries = self.entries.lock().await;
        let previous = entries.insert(key.to_owned(), value.to_owned());
        if let Err(e) = self.persist(&entries).await {
            // EDGE: keep memory consistent with disk when the write fails.
            match previous {
                Some(old) => entries.insert(key.to_owned(), old),
                None => entries.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), BackendError> {
        let mut entries = self.entries.lock().await;
        let Some(previous) = entries.remove(key) else {
            return Ok(());
        };
        if let Err(e) = self.persist(&entries).await {
            entries.insert(key.to_owned(), previous);
            return Err(e);
        }
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, BackendError> {
        Ok(self.entries.lock().await.keys().cloned().collect())
    }
}

#[cfg(test)]
#[path = "file_test.rs"]
mod tests;

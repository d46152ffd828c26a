//! In-memory backend. Process-local; optional byte quota.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::{BackendError, StorageBackend};

/// Shared in-memory map. Clones share the same underlying store.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    entries: Arc<RwLock<HashMap<String, String>>>,
    /// Maximum total bytes (keys + values). `None` means unbounded.
    quota_bytes: Option<usize>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend that rejects writes once keys plus values exceed `quota_bytes`.
    #[must_use]
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self { entries: Arc::default(), quota_bytes: Some(quota_bytes) }
    }

    /// Total bytes currently used by keys and values.
    pub async fn used_bytes(&self) -> usize {
        let entries = self.entries.read().await;
        entries.iter().map(|(k, v)| k.len() + v.len()).sum()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), BackendError> {
        let mut entries = self.entries.write().await;
        if let Some(quota) = self.quota_bytes {
            let current: usize = entries.iter().map(|(k, v)| k.len() + v.len()).sum();
            let replaced = entries.get(key).map_or(0, |old| key.len() + old.len());
            let needed = current - replaced + key.len() + value.len();
            if needed > quota {
                return Err(BackendError::QuotaExceeded { needed, available: quota });
            }
        }
        entries.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), BackendError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, BackendError> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;

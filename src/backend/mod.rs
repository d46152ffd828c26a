//! Storage backends — the single shared key-value namespace.
//!
//! ARCHITECTURE
//! ============
//! Every higher-level service depends on [`StorageBackend`] and nothing
//! else for persistence. Values are strings, the way a browser's
//! `localStorage` holds them; serialization, compression and integrity
//! sidecars are layered on top by the services.
//!
//! Backends make no atomicity promise across calls. Read-modify-write
//! sequences are serialized per key by [`crate::state::KeyLocks`] inside
//! the services, not here.

pub mod file;
pub mod memory;

pub use file::FileBackend;
pub use memory::MemoryBackend;

use crate::error::ErrorCode;

// =============================================================================
// ERROR
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Writing the value would exceed the backend's byte quota.
    #[error("quota exceeded: need {needed} bytes, {available} available")]
    QuotaExceeded { needed: usize, available: usize },
    /// Transient failure; the same call may succeed later.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The persisted store itself could not be decoded.
    #[error("backend data corrupt: {0}")]
    Corrupt(String),
}

impl ErrorCode for BackendError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::QuotaExceeded { .. } => "E_STORAGE_QUOTA_EXCEEDED",
            Self::Unavailable(_) => "E_BACKEND_UNAVAILABLE",
            Self::Io(_) => "E_BACKEND_IO",
            Self::Corrupt(_) => "E_BACKEND_CORRUPT",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Io(_))
    }
}

// =============================================================================
// TRAIT
// =============================================================================

/// Async key-value store holding string values. Enables in-memory fakes in tests.
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync {
    /// Return the value stored under `key`, or `None` if absent.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] if the store cannot be read.
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError>;

    /// Store `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::QuotaExceeded`] when the store is full, or
    /// another [`BackendError`] if the write fails.
    async fn set(&self, key: &str, value: &str) -> Result<(), BackendError>;

    /// Remove `key`. Removing an absent key is not an error.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] if the removal fails.
    async fn remove(&self, key: &str) -> Result<(), BackendError>;

    /// List every key currently in the store, in no particular order.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] if the store cannot be read.
    async fn keys(&self) -> Result<Vec<String>, BackendError>;

    /// List keys starting with `prefix`.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] if the store cannot be read.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        Ok(self
            .keys()
            .await?
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .collect())
    }

    /// # Errors
    ///
    /// Returns a [`BackendError`] if the store cannot be read.
    async fn contains(&self, key: &str) -> Result<bool, BackendError> {
        Ok(self.get(key).await?.is_some())
    }
}

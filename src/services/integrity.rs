//! Integrity service — checksums, metadata sidecars, corruption recovery.
//!
//! DESIGN
//! ======
//! Each live entry `<key>` has two sidecars: `_checksum_<key>` (hex SHA-256
//! of the stored payload) and `_meta_<key>` (JSON metadata). Verification
//! compares a payload against the recorded checksum. A payload with no
//! recorded checksum is accepted as a first write and recorded.
//!
//! On mismatch the payload is quarantined under `corrupted_<key>_<ms>` and
//! the newest backup of exactly `<key>`, if any, is restored in place.
//!
//! This service never takes key locks. Callers that verify or record hold
//! the key's lock, since recovery rewrites the entry.
//!
//! ERROR HANDLING
//! ==============
//! A mismatch is an outcome ([`Verification::Corrupted`]), not an error.
//! Backend failures while reading or writing sidecars are
//! [`IntegrityError`]s.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use crate::backend::BackendError;
use crate::error::ErrorCode;
use crate::events::{EventKind, StorageEvent, now_ms};
use crate::services::backup::Backups;
use crate::services::oplog;
use crate::state::StoreContext;

pub const CHECKSUM_PREFIX: &str = "_checksum_";
pub const META_PREFIX: &str = "_meta_";
pub const QUARANTINE_PREFIX: &str = "corrupted_";
pub const METADATA_VERSION: &str = "1.0";

const CHECKSUM_MISMATCH: &str = "CHECKSUM_VALIDATION_FAILED";
const METADATA_CORRUPTED: &str = "METADATA_CORRUPTION_DETECTED";

// =============================================================================
// ERROR
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum IntegrityError {
    #[error("integrity backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("metadata serialization failed: {0}")]
    Serialization(String),
}

impl ErrorCode for IntegrityError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Backend(e) => e.error_code(),
            Self::Serialization(_) => "E_INTEGRITY_SERIALIZATION",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Backend(e) => e.retryable(),
            Self::Serialization(_) => false,
        }
    }
}

// =============================================================================
// TYPES
// =============================================================================

/// Sidecar stored under `_meta_<key>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub version: String,
    pub created_at: i64,
    pub checksum: String,
    pub last_check: i64,
    pub checks: u64,
}

impl Metadata {
    fn is_valid(&self) -> bool {
        !self.version.is_empty() && self.created_at > 0
    }
}

/// Outcome of verifying a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// No checksum was recorded; one has been recorded now.
    FirstWrite,
    Valid,
    /// A checksum exists but its metadata is missing or malformed.
    MetadataInvalid,
    /// Checksum mismatch. The payload was quarantined and, when a backup
    /// existed, the entry was restored from it.
    Corrupted { quarantine_key: String, restored_from: Option<String> },
}

impl Verification {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::FirstWrite | Self::Valid)
    }
}

/// Lowercase hex SHA-256 of `data`.
#[must_use]
pub fn checksum(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

#[must_use]
pub fn checksum_key(key: &str) -> String {
    format!("{CHECKSUM_PREFIX}{key}")
}

#[must_use]
pub fn meta_key(key: &str) -> String {
    format!("{META_PREFIX}{key}")
}

// =============================================================================
// SERVICE
// =============================================================================

#[derive(Clone)]
pub struct IntegrityService {
    ctx: StoreContext,
    backups: Backups,
}

impl IntegrityService {
    #[must_use]
    pub fn new(ctx: StoreContext) -> Self {
        let backups = Backups::new(ctx.clone());
        Self { ctx, backups }
    }

    /// Verify `payload` as the current stored value of `key`.
    ///
    /// # Errors
    ///
    /// Returns an [`IntegrityError`] if sidecars cannot be read or written.
    pub async fn verify(&self, key: &str, payload: &str) -> Result<Verification, IntegrityError> {
        let current = checksum(payload);
        let Some(stored) = self.ctx.backend.get(&checksum_key(key)).await? else {
            self.write_sidecars(key, &current, None).await?;
            return Ok(Verification::FirstWrite);
        };

        let Some(mut meta) = self.metadata(key).await?.filter(Metadata::is_valid) else {
            warn!(key, "integrity metadata missing or malformed");
            self.log_corruption(key, METADATA_CORRUPTED).await;
            self.ctx.events.emit(
                StorageEvent::new(EventKind::DataCorruption)
                    .with_key(key)
                    .with_data("reason", METADATA_CORRUPTED),
            );
            return Ok(Verification::MetadataInvalid);
        };

        let now = now_ms();
        if now.saturating_sub(meta.last_check) > self.ctx.config.integrity.freshness_window_ms {
            meta.last_check = now;
            meta.checks += 1;
            self.put_metadata(key, &meta).await?;
        }

        if stored == current {
            return Ok(Verification::Valid);
        }

        error!(key, "checksum mismatch");
        self.log_corruption(key, CHECKSUM_MISMATCH).await;
        self.recover(key, payload).await
    }

    async fn recover(&self, key: &str, payload: &str) -> Result<Verification, IntegrityError> {
        let quarantine_key = format!("{QUARANTINE_PREFIX}{key}_{}", now_ms());
        self.ctx.backend.set(&quarantine_key, payload).await?;

        let restored_from = match self.backups.latest(key).await? {
            Some((backup_key, record)) => {
                self.ctx.backend.set(key, &record.value).await?;
                self.record(key, &record.value).await?;
                info!(key, backup_key = %backup_key, "entry restored from backup");
                Some(backup_key)
            }
            None => None,
        };

        let mut event = StorageEvent::new(EventKind::DataCorruption)
            .with_key(key)
            .with_data("timestamp", now_ms())
            .with_data("backupFound", restored_from.is_some())
            .with_data("corruptedKey", quarantine_key.clone());
        if let Some(backup_key) = &restored_from {
            event = event.with_data("backupKey", backup_key.clone());
        }
        self.ctx.events.emit(event);

        Ok(Verification::Corrupted { quarantine_key, restored_from })
    }

    /// Recompute both sidecars after a write. `createdAt` survives rewrites.
    ///
    /// # Errors
    ///
    /// Returns an [`IntegrityError`] if the sidecars cannot be written.
    pub async fn record(&self, key: &str, payload: &str) -> Result<(), IntegrityError> {
        let previous = self.metadata(key).await?.filter(Metadata::is_valid);
        self.write_sidecars(key, &checksum(payload), previous).await
    }

    async fn write_sidecars(
        &self,
        key: &str,
        sum: &str,
        previous: Option<Metadata>,
    ) -> Result<(), IntegrityError> {
        let now = now_ms();
        let meta = Metadata {
            version: METADATA_VERSION.to_owned(),
            created_at: previous.as_ref().map_or(now, |m| m.created_at),
            checksum: sum.to_owned(),
            last_check: now,
            checks: previous.map_or(0, |m| m.checks),
        };
        self.ctx.backend.set(&checksum_key(key), sum).await?;
        self.put_metadata(key, &meta).await
    }

    async fn put_metadata(&self, key: &str, meta: &Metadata) -> Result<(), IntegrityError> {
        let body = serde_json::to_string(meta).map_err(|e| IntegrityError::Serialization(e.to_string()))?;
        self.ctx.backend.set(&meta_key(key), &body).await?;
        Ok(())
    }

    /// Parsed metadata for `key`; `None` when absent or not decodable.
    ///
    /// # Errors
    ///
    /// Returns an [`IntegrityError`] if the backend cannot be read.
    pub async fn metadata(&self, key: &str) -> Result<Option<Metadata>, IntegrityError> {
        let Some(raw) = self.ctx.backend.get(&meta_key(key)).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(meta) => Ok(Some(meta)),
            Err(e) => {
                warn!(key, error = %e, "undecodable integrity metadata");
                Ok(None)
            }
        }
    }

    /// Drop both sidecars of `key`.
    ///
    /// # Errors
    ///
    /// Returns an [`IntegrityError`] if removal fails.
    pub async fn forget(&self, key: &str) -> Result<(), IntegrityError> {
        self.ctx.backend.remove(&checksum_key(key)).await?;
        self.ctx.backend.remove(&meta_key(key)).await?;
        Ok(())
    }

    async fn log_corruption(&self, key: &str, reason: &str) {
        let entry = serde_json::json!({ "key": key, "error": reason, "timestamp": now_ms() });
        oplog::append(&self.ctx, oplog::CORRUPTION_LOG, &entry).await;
    }

    /// Persisted corruption reports, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] if the log cannot be read.
    pub async fn corruption_logs(&self) -> Result<Vec<serde_json::Value>, BackendError> {
        oplog::entries(&self.ctx, oplog::CORRUPTION_LOG).await
    }
}

#[cfg(test)]
#[path = "integrity_test.rs"]
mod tests;

//! Delete service — verified, backed-up removal of entries.
//!
//! DESIGN
//! ======
//! Under the key's lock: load the payload, check it parses and matches its
//! checksum, write a `pre_delete` backup, optionally overwrite the payload
//! with filler, then remove the entry and both sidecars.
//!
//! ERROR HANDLING
//! ==============
//! Unlike saves, a failed backup aborts the delete: nothing is removed
//! without a copy unless the caller opted out of backups.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::BackendError;
use crate::error::{ErrorCode, StorageError};
use crate::events::{StorageEvent, now_ms};
use crate::services::backup::{BackupKind, Backups};
use crate::services::batch::{self, BatchReport};
use crate::services::codec;
use crate::services::integrity::IntegrityService;
use crate::services::keys::{KeyOptions, KeyValidator};
use crate::services::oplog::{self, OperationLogEntry};
use crate::services::read::ReadCache;
use crate::state::StoreContext;

const SECURE_FILLER: char = '*';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteOptions {
    pub create_backup: bool,
    pub verify_integrity: bool,
    pub notify: bool,
    /// Overwrite the payload with filler before removing it.
    pub secure: bool,
}

impl Default for DeleteOptions {
    fn default() -> Self {
        Self { create_backup: true, verify_integrity: true, notify: true, secure: false }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteReceipt {
    pub key: String,
    pub backup_key: Option<String>,
    pub timestamp: i64,
}

#[derive(Clone)]
pub struct DeleteService {
    ctx: StoreContext,
    keys: KeyValidator,
    integrity: IntegrityService,
    backups: Backups,
    cache: ReadCache,
}

impl DeleteService {
    #[must_use]
    pub fn new(ctx: StoreContext, cache: ReadCache) -> Self {
        Self {
            keys: KeyValidator::new(ctx.clone()),
            integrity: IntegrityService::new(ctx.clone()),
            backups: Backups::new(ctx.clone()),
            ctx,
            cache,
        }
    }

    /// Delete `key` and its sidecars.
    ///
    /// # Errors
    ///
    /// `InvalidKey`, `KeyNotFound`, `IntegrityCheckFailed`, `BackupFailed`,
    /// or a wrapped backend/integrity error.
    pub async fn delete_item(&self, key: &str, opts: &DeleteOptions) -> Result<DeleteReceipt, StorageError> {
        let result = self.delete_inner(key, opts).await;
        match &result {
            Ok(_) => oplog::append(&self.ctx, oplog::DELETE_LOG, &OperationLogEntry::succeeded(key)).await,
            Err(e) => {
                debug!(key, error = %e, code = e.error_code(), "delete failed");
                oplog::append(&self.ctx, oplog::DELETE_LOG, &OperationLogEntry::failed(key, e)).await;
            }
        }
        result
    }

    async fn delete_inner(&self, key: &str, opts: &DeleteOptions) -> Result<DeleteReceipt, StorageError> {
        self.keys.validate(key, &KeyOptions::storage()).await?;

        let _guard = self.ctx.locks.acquire(key).await;
        let Some(raw) = self.ctx.backend.get(key).await? else {
            return Err(StorageError::KeyNotFound(key.to_owned()));
        };

        if opts.verify_integrity {
            self.check_intact(key, &raw).await?;
        }

        let backup_key = if opts.create_backup {
            let created = self
                .backups
                .create(key, &raw, BackupKind::PreDelete)
                .await
                .map_err(|e| StorageError::BackupFailed { key: key.to_owned(), reason: e.to_string() })?;
            Some(created)
        } else {
            None
        };

        if opts.secure {
            self.overwrite(key, raw.len()).await?;
        }

        self.ctx.backend.remove(key).await?;
        self.cache.invalidate(key);
        // Sidecar cleanup is best effort once the entry is gone.
        if let Err(e) = self.integrity.forget(key).await {
            warn!(key, error = %e, "sidecar cleanup failed after delete");
        }

        if opts.notify {
            self.ctx.events.emit(StorageEvent::change("delete", key));
        }

        Ok(DeleteReceipt { key: key.to_owned(), backup_key, timestamp: now_ms() })
    }

    async fn check_intact(&self, key: &str, raw: &str) -> Result<(), StorageError> {
        let parses = codec::decode(raw)
            .map(|text| serde_json::from_str::<serde_json::Value>(&text).is_ok())
            .unwrap_or(false);
        if !parses {
            warn!(key, "payload does not parse; refusing delete");
            return Err(StorageError::IntegrityCheckFailed { key: key.to_owned(), persisted: false });
        }
        let outcome = self.integrity.verify(key, raw).await?;
        if !outcome.is_valid() {
            return Err(StorageError::IntegrityCheckFailed { key: key.to_owned(), persisted: false });
        }
        Ok(())
    }

    async fn overwrite(&self, key: &str, len: usize) -> Result<(), BackendError> {
        let filler: String = std::iter::repeat_n(SECURE_FILLER, len).collect();
        let passes = self.ctx.config.delete.secure_passes;
        let pause = Duration::from_millis(self.ctx.config.delete.secure_pass_delay_ms);
        for _ in 0..passes {
            self.ctx.backend.set(key, &filler).await?;
            tokio::time::sleep(pause).await;
        }
        debug!(key, passes, "payload overwritten");
        Ok(())
    }

    /// Delete many keys in chunks, pausing between chunks.
    pub async fn batch_delete(&self, keys: Vec<String>, opts: &DeleteOptions) -> BatchReport<DeleteReceipt> {
        let (this, opts) = (self, *opts);
        let pause = Duration::from_millis(self.ctx.config.delete.chunk_pause_ms);
        let report = batch::run_chunked(keys, self.ctx.config.delete.batch_size, Some(pause), move |key: String| async move {
            let outcome = this.delete_item(&key, &opts).await;
            (key, outcome)
        })
        .await;
        info!(total = report.total(), failed = report.failed.len(), "batch delete finished");
        report.announce(&self.ctx.events, "delete");
        report
    }

    /// # Errors
    ///
    /// Returns a [`BackendError`] if the log cannot be read.
    pub async fn delete_logs(&self) -> Result<Vec<OperationLogEntry>, BackendError> {
        oplog::typed_entries(&self.ctx, oplog::DELETE_LOG).await
    }
}

#[cfg(test)]
#[path = "delete_test.rs"]
mod tests;

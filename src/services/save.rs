//! Save service — validated, size-checked, optionally compressed writes.
//!
//! DESIGN
//! ======
//! The pipeline per item is: validate key and value, serialize, enforce the
//! size limit, compress large payloads, back up the previous payload, write
//! with retries, verify by re-reading, record checksum sidecars, then log,
//! notify and drop the cached value.
//!
//! Everything from the backup onward runs under the key's lock.
//!
//! ERROR HANDLING
//! ==============
//! Only retryable backend errors are retried, with a linear backoff of
//! `retry_delay_ms * attempt`. A failed pre-save backup is logged and the
//! save continues. A re-read mismatch fails with
//! `IntegrityCheckFailed { persisted: true }`: the payload is in the backend
//! but unverified, and it is not rolled back.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::backend::BackendError;
use crate::error::{ErrorCode, StorageError};
use crate::events::{StorageEvent, now_ms};
use crate::services::backup::{BackupKind, Backups};
use crate::services::batch::{self, BatchReport};
use crate::services::codec;
use crate::services::integrity::IntegrityService;
use crate::services::json::{JsonError, JsonOptions, JsonValidator, Schema};
use crate::services::keys::{KeyOptions, KeyValidator};
use crate::services::oplog::{self, OperationLogEntry};
use crate::services::read::ReadCache;
use crate::state::StoreContext;

#[derive(Clone)]
pub struct SaveOptions {
    pub compress: bool,
    pub validate: bool,
    pub verify_integrity: bool,
    pub create_backup: bool,
    pub schema: Option<Arc<dyn Schema>>,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self { compress: true, validate: true, verify_integrity: true, create_backup: true, schema: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveReceipt {
    pub key: String,
    /// Length of the stored payload, after compression.
    pub size: usize,
    pub compressed: bool,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveItem {
    pub key: String,
    pub data: Value,
}

#[derive(Clone)]
pub struct SaveService {
    ctx: StoreContext,
    keys: KeyValidator,
    json: JsonValidator,
    integrity: IntegrityService,
    backups: Backups,
    cache: ReadCache,
}

impl SaveService {
    #[must_use]
    pub fn new(ctx: StoreContext, cache: ReadCache) -> Self {
        Self {
            keys: KeyValidator::new(ctx.clone()),
            json: JsonValidator::new(ctx.clone()),
            integrity: IntegrityService::new(ctx.clone()),
            backups: Backups::new(ctx.clone()),
            ctx,
            cache,
        }
    }

    /// Save `data` under `key`.
    ///
    /// # Errors
    ///
    /// `InvalidKey`, `InvalidData`, `StorageQuotaExceeded`,
    /// `CompressionFailed`, `IntegrityCheckFailed`, or a wrapped
    /// backend/integrity error.
    pub async fn save_item(&self, key: &str, data: &Value, opts: &SaveOptions) -> Result<SaveReceipt, StorageError> {
        let result = self.save_inner(key, data, opts).await;
        match &result {
            Ok(receipt) => {
                debug!(key, size = receipt.size, compressed = receipt.compressed, "saved");
                oplog::append(&self.ctx, oplog::SAVE_LOG, &OperationLogEntry::succeeded(key)).await;
            }
            Err(e) => {
                warn!(key, error = %e, code = e.error_code(), "save failed");
                oplog::append(&self.ctx, oplog::SAVE_LOG, &OperationLogEntry::failed(key, e)).await;
            }
        }
        result
    }

    async fn save_inner(&self, key: &str, data: &Value, opts: &SaveOptions) -> Result<SaveReceipt, StorageError> {
        let limits = self.ctx.config.save;
        self.keys.validate(key, &KeyOptions::storage()).await?;

        if opts.validate {
            let json_opts = JsonOptions {
                schema: opts.schema.clone(),
                max_size_bytes: Some(limits.max_value_bytes),
                ..JsonOptions::default()
            };
            match self.json.validate(data, &json_opts).await {
                Ok(()) => {}
                Err(JsonError::TooLarge { size, max }) => return Err(StorageError::StorageQuotaExceeded { size, max }),
                Err(e) => return Err(e.into()),
            }
        }

        let serialized = serde_json::to_string(data).map_err(|e| JsonError::InvalidFormat(e.to_string()))?;
        if serialized.len() > limits.max_value_bytes {
            return Err(StorageError::StorageQuotaExceeded { size: serialized.len(), max: limits.max_value_bytes });
        }

        let payload = if opts.compress && serialized.len() > limits.compression_threshold {
            codec::compress(&serialized).map_err(|e| StorageError::CompressionFailed(e.to_string()))?
        } else {
            serialized
        };
        let compressed = codec::is_compressed(&payload);

        let _guard = self.ctx.locks.acquire(key).await;

        if opts.create_backup {
            self.backup_previous(key).await;
        }

        self.write_with_retry(key, &payload).await?;
        self.cache.invalidate(key);

        if opts.verify_integrity {
            let stored = self.ctx.backend.get(key).await?;
            if stored.as_deref() != Some(payload.as_str()) {
                error!(key, "re-read after save does not match written payload");
                return Err(StorageError::IntegrityCheckFailed { key: key.to_owned(), persisted: true });
            }
        }
        self.integrity.record(key, &payload).await?;

        self.ctx
            .events
            .emit(StorageEvent::change("save", key).with_data("size", payload.len()));

        Ok(SaveReceipt { key: key.to_owned(), size: payload.len(), compressed, timestamp: now_ms() })
    }

    async fn backup_previous(&self, key: &str) {
        match self.ctx.backend.get(key).await {
            Ok(Some(previous)) => {
                if let Err(e) = self.backups.create(key, &previous, BackupKind::PreSave).await {
                    warn!(key, error = %e, "pre-save backup failed; continuing");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(key, error = %e, "pre-save backup read failed; continuing"),
        }
    }

    async fn write_with_retry(&self, key: &str, payload: &str) -> Result<(), BackendError> {
        let attempts = self.ctx.config.save.retry_attempts.max(1);
        let delay_ms = self.ctx.config.save.retry_delay_ms;
        let mut attempt = 1;
        loop {
            match self.ctx.backend.set(key, payload).await {
                Ok(()) => return Ok(()),
                Err(e) if e.retryable() && attempt < attempts => {
                    warn!(key, attempt, error = %e, "write failed; retrying");
                    tokio::time::sleep(Duration::from_millis(delay_ms * u64::from(attempt))).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(key, attempt, error = %e, "write failed");
                    return Err(e);
                }
            }
        }
    }

    /// Save many items in chunks. Failures are collected, not raised.
    pub async fn batch_save(&self, items: Vec<SaveItem>, opts: &SaveOptions) -> BatchReport<SaveReceipt> {
        let this = self;
        let report = batch::run_chunked(items, self.ctx.config.save.batch_size, None, move |item: SaveItem| async move {
            let outcome = this.save_item(&item.key, &item.data, opts).await;
            (item.key, outcome)
        })
        .await;
        info!(
            total = report.total(),
            failed = report.failed.len(),
            "batch save finished"
        );
        report.announce(&self.ctx.events, "save");
        report
    }

    /// # Errors
    ///
    /// Returns a [`BackendError`] if the log cannot be read.
    pub async fn save_logs(&self) -> Result<Vec<OperationLogEntry>, BackendError> {
        oplog::typed_entries(&self.ctx, oplog::SAVE_LOG).await
    }
}

#[cfg(test)]
#[path = "save_test.rs"]
mod tests;

//! Read service — cached, time-bounded reads with integrity verification.
//!
//! DESIGN
//! ======
//! Fresh cache entries are served without touching the backend. Otherwise
//! the key's lock and the backend read race a timeout; the payload is then
//! decoded, parsed, optionally verified against its checksum and cached.
//! The cache is filled while the key's lock is held, so a concurrent save
//! cannot be shadowed by a stale fill.
//!
//! [`ReadCache`] is shared with the save and delete services, which drop a
//! key's entry as soon as they change it.
//!
//! ERROR HANDLING
//! ==============
//! Absent keys are `KeyNotFound`; payloads that do not decode or parse are
//! `ParseError`. Every outcome is appended to `read_operations_log`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::backend::BackendError;
use crate::error::StorageError;
use crate::events::now_ms;
use crate::services::batch::{self, BatchReport};
use crate::services::codec;
use crate::services::integrity::{IntegrityService, Verification};
use crate::services::keys::{KeyOptions, KeyValidator};
use crate::services::oplog::{self, OperationLogEntry};
use crate::state::StoreContext;

// =============================================================================
// CACHE
// =============================================================================

struct CacheEntry {
    value: Value,
    stored_at: i64,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
}

/// Hit/miss counters and current size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Bounded, TTL-based cache of parsed values. Clones share one cache.
#[derive(Clone)]
pub struct ReadCache {
    inner: Arc<Mutex<CacheInner>>,
    ttl_ms: i64,
    max_entries: usize,
}

impl ReadCache {
    #[must_use]
    pub fn new(ttl_ms: i64, max_entries: usize) -> Self {
        Self { inner: Arc::default(), ttl_ms, max_entries: max_entries.max(1) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fresh value and the time it was cached. Expired entries are dropped.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<(Value, i64)> {
        let mut inner = self.lock();
        let now = now_ms();
        let fresh = match inner.entries.get(key) {
            Some(entry) if now - entry.stored_at < self.ttl_ms => Some((entry.value.clone(), entry.stored_at)),
            Some(_) => {
                inner.entries.remove(key);
                None
            }
            None => None,
        };
        if fresh.is_some() {
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }
        fresh
    }

    pub fn put(&self, key: &str, value: Value) {
        let mut inner = self.lock();
        if !inner.entries.contains_key(key) && inner.entries.len() >= self.max_entries {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.stored_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                inner.entries.remove(&oldest);
            }
        }
        inner.entries.insert(key.to_owned(), CacheEntry { value, stored_at: now_ms() });
    }

    pub fn invalidate(&self, key: &str) {
        self.lock().entries.remove(key);
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats { entries: inner.entries.len(), hits: inner.hits, misses: inner.misses }
    }
}

// =============================================================================
// SERVICE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
    pub use_cache: bool,
    pub verify_integrity: bool,
    /// Overrides the configured read timeout.
    pub timeout_ms: Option<u64>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self { use_cache: true, verify_integrity: true, timeout_ms: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadSource {
    Cache,
    Storage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadResult {
    pub key: String,
    pub data: Value,
    pub source: ReadSource,
    /// Cache fill time for cached reads, read time otherwise.
    pub timestamp: i64,
}

#[derive(Clone)]
pub struct ReadService {
    ctx: StoreContext,
    keys: KeyValidator,
    integrity: IntegrityService,
    cache: ReadCache,
}

impl ReadService {
    #[must_use]
    pub fn new(ctx: StoreContext, cache: ReadCache) -> Self {
        Self {
            keys: KeyValidator::new(ctx.clone()),
            integrity: IntegrityService::new(ctx.clone()),
            ctx,
            cache,
        }
    }

    #[must_use]
    pub fn cache(&self) -> &ReadCache {
        &self.cache
    }

    /// Read and parse the value stored under `key`.
    ///
    /// # Errors
    ///
    /// `InvalidKey`, `KeyNotFound`, `ParseError`, `IntegrityCheckFailed`,
    /// `Timeout`, or a wrapped backend/integrity error.
    pub async fn read_item(&self, key: &str, opts: &ReadOptions) -> Result<ReadResult, StorageError> {
        let result = self.read_inner(key, opts).await;
        match &result {
            // Cache hits are not logged.
            Ok(r) if r.source == ReadSource::Cache => {}
            Ok(_) => oplog::append(&self.ctx, oplog::READ_LOG, &OperationLogEntry::succeeded(key)).await,
            Err(e) => {
                debug!(key, error = %e, "read failed");
                oplog::append(&self.ctx, oplog::READ_LOG, &OperationLogEntry::failed(key, e)).await;
            }
        }
        result
    }

    async fn read_inner(&self, key: &str, opts: &ReadOptions) -> Result<ReadResult, StorageError> {
        self.keys.validate(key, &KeyOptions::storage()).await?;

        if opts.use_cache {
            if let Some((data, timestamp)) = self.cache.get(key) {
                return Ok(ReadResult { key: key.to_owned(), data, source: ReadSource::Cache, timestamp });
            }
        }

        let timeout_ms = opts.timeout_ms.unwrap_or(self.ctx.config.read.timeout_ms);
        let load = async {
            let guard = self.ctx.locks.acquire(key).await;
            let raw = self.ctx.backend.get(key).await;
            (guard, raw)
        };
        let Ok((_guard, raw)) = tokio::time::timeout(Duration::from_millis(timeout_ms), load).await else {
            warn!(key, timeout_ms, "read timed out");
            return Err(StorageError::Timeout { key: key.to_owned(), timeout_ms });
        };
        let Some(raw) = raw? else {
            return Err(StorageError::KeyNotFound(key.to_owned()));
        };

        let serialized = codec::decode(&raw)
            .map_err(|e| StorageError::ParseError { key: key.to_owned(), message: e.to_string() })?;
        let data: Value = serde_json::from_str(&serialized)
            .map_err(|e| StorageError::ParseError { key: key.to_owned(), message: e.to_string() })?;

        if opts.verify_integrity {
            let outcome = self.integrity.verify(key, &raw).await?;
            if !outcome.is_valid() {
                if let Verification::Corrupted { restored_from: Some(backup), .. } = &outcome {
                    warn!(key, backup = %backup, "read hit corrupted entry; restored from backup");
                }
                self.cache.invalidate(key);
                return Err(StorageError::IntegrityCheckFailed { key: key.to_owned(), persisted: false });
            }
        }

        self.cache.put(key, data.clone());
        Ok(ReadResult { key: key.to_owned(), data, source: ReadSource::Storage, timestamp: now_ms() })
    }

    /// Read many keys in chunks. Failures are collected, not raised.
    pub async fn batch_read(&self, keys: Vec<String>, opts: &ReadOptions) -> BatchReport<ReadResult> {
        let (this, opts) = (self, *opts);
        let report = batch::run_chunked(keys, self.ctx.config.read.batch_size, None, move |key: String| async move {
            let outcome = this.read_item(&key, &opts).await;
            (key, outcome)
        })
        .await;
        report.announce(&self.ctx.events, "read");
        report
    }

    /// # Errors
    ///
    /// Returns a [`BackendError`] if the log cannot be read.
    pub async fn read_logs(&self) -> Result<Vec<OperationLogEntry>, BackendError> {
        oplog::typed_entries(&self.ctx, oplog::READ_LOG).await
    }
}

#[cfg(test)]
#[path = "read_test.rs"]
mod tests;

//! Data loader — multi-key loads under one deadline, with retries and counters.
//!
//! DESIGN
//! ======
//! [`DataLoader::load`] answers a request entirely from the shared
//! [`ReadCache`] when every key is fresh there. Otherwise it reads the keys in
//! chunks through the [`ReadService`] and retries the whole load with
//! `retry_delay_ms * attempt` back-off while the failure is retryable. One
//! timeout bounds all attempts together.
//!
//! Absent keys are left out of the result. A key that fails for a
//! non-retryable reason (bad payload, integrity or structure check) is
//! reported and left out; the rest of the load still succeeds.
//!
//! ERROR HANDLING
//! ==============
//! Failures are appended to `data_loader_logs`, counted in
//! [`LoaderStats::errors`] and announced as `data_loader_error`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::backend::BackendError;
use crate::error::{ErrorCode, StorageError};
use crate::events::{EventKind, StorageEvent, now_ms};
use crate::services::json::{JsonOptions, JsonValidator};
use crate::services::oplog;
use crate::services::read::{ReadCache, ReadOptions, ReadService};
use crate::state::StoreContext;

/// Loaded values by key.
pub type Loaded = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    pub use_cache: bool,
    /// Verify checksums and structural limits of every loaded value.
    pub validate: bool,
    /// Overrides the configured load timeout.
    pub timeout_ms: Option<u64>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self { use_cache: true, validate: true, timeout_ms: None }
    }
}

/// Loads answered from cache, loads that went to storage, failures reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderStats {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
}

/// Entry of `data_loader_logs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadErrorEntry {
    pub keys: Vec<String>,
    pub code: String,
    pub error: String,
    pub timestamp: i64,
}

#[derive(Clone)]
pub struct DataLoader {
    ctx: StoreContext,
    reader: ReadService,
    json: JsonValidator,
    stats: Arc<Mutex<LoaderStats>>,
}

impl DataLoader {
    #[must_use]
    pub fn new(ctx: StoreContext, cache: ReadCache) -> Self {
        Self {
            reader: ReadService::new(ctx.clone(), cache),
            json: JsonValidator::new(ctx.clone()),
            ctx,
            stats: Arc::default(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LoaderStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load every present key of `keys`.
    ///
    /// # Errors
    ///
    /// `Timeout` when the deadline passes, or the last retryable error once
    /// attempts run out.
    pub async fn load(&self, keys: &[String], opts: &LoadOptions) -> Result<Loaded, StorageError> {
        if opts.use_cache {
            if let Some(cached) = self.cached(keys) {
                self.lock().hits += 1;
                return Ok(cached);
            }
        }
        self.lock().misses += 1;

        let timeout_ms = opts.timeout_ms.unwrap_or(self.ctx.config.loader.timeout_ms);
        let deadline = Duration::from_millis(timeout_ms);
        let outcome = match tokio::time::timeout(deadline, self.load_with_retry(keys, opts)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(keys = keys.len(), timeout_ms, "load timed out");
                Err(StorageError::Timeout { key: keys.join(","), timeout_ms })
            }
        };

        match outcome {
            Ok(loaded) => {
                debug!(requested = keys.len(), loaded = loaded.len(), "load finished");
                Ok(loaded)
            }
            Err(e) => {
                self.report(keys.to_vec(), &e).await;
                Err(e)
            }
        }
    }

    fn cached(&self, keys: &[String]) -> Option<Loaded> {
        let cache = self.reader.cache();
        keys.iter().map(|key| cache.get(key).map(|(value, _)| (key.clone(), value))).collect()
    }

    async fn load_with_retry(&self, keys: &[String], opts: &LoadOptions) -> Result<Loaded, StorageError> {
        let config = self.ctx.config.loader;
        let attempts = config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.load_chunks(keys, opts).await {
                Ok(loaded) => return Ok(loaded),
                Err(e) if e.retryable() && attempt < attempts => {
                    warn!(attempt, total = attempts, error = %e, "load failed; retrying");
                    tokio::time::sleep(Duration::from_millis(config.retry_delay_ms * u64::from(attempt))).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn load_chunks(&self, keys: &[String], opts: &LoadOptions) -> Result<Loaded, StorageError> {
        let mut loaded = Loaded::new();
        for chunk in keys.chunks(self.ctx.config.loader.batch_size.max(1)) {
            let outcomes = join_all(chunk.iter().map(|key| async move { (key, self.load_one(key, opts).await) })).await;
            for (key, outcome) in outcomes {
                match outcome {
                    Ok(Some(value)) => {
                        loaded.insert(key.clone(), value);
                    }
                    Ok(None) => {}
                    // EDGE: one transient failure fails the attempt, so it is retried whole.
                    Err(e) if e.retryable() => return Err(e),
                    Err(e) => self.report(vec![key.clone()], &e).await,
                }
            }
        }
        Ok(loaded)
    }

    async fn load_one(&self, key: &str, opts: &LoadOptions) -> Result<Option<Value>, StorageError> {
        let read_opts = ReadOptions { use_cache: opts.use_cache, verify_integrity: opts.validate, timeout_ms: None };
        let data = match self.reader.read_item(key, &read_opts).await {
            Ok(result) => result.data,
            Err(StorageError::KeyNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        if opts.validate {
            if let Err(e) = self.json.validate(&data, &JsonOptions::default()).await {
                self.reader.cache().invalidate(key);
                return Err(StorageError::ValidationFailed(format!("{key}: {e}")));
            }
        }
        Ok(Some(data))
    }

    async fn report(&self, keys: Vec<String>, err: &StorageError) {
        self.lock().errors += 1;
        warn!(keys = ?keys, error = %err, code = err.error_code(), "load error");
        let entry = LoadErrorEntry {
            keys: keys.clone(),
            code: err.error_code().to_owned(),
            error: err.to_string(),
            timestamp: now_ms(),
        };
        oplog::append(&self.ctx, oplog::DATA_LOADER_LOG, &entry).await;
        self.ctx.events.emit(
            StorageEvent::new(EventKind::DataLoaderError)
                .with_data("keys", keys)
                .with_data("error", err.error_code()),
        );
    }

    #[must_use]
    pub fn stats(&self) -> LoaderStats {
        *self.lock()
    }

    /// # Errors
    ///
    /// Returns a [`BackendError`] if the log cannot be read.
    pub async fn error_logs(&self) -> Result<Vec<LoadErrorEntry>, BackendError> {
        oplog::typed_entries(&self.ctx, oplog::DATA_LOADER_LOG).await
    }
}

#[cfg(test)]
#[path = "loader_test.rs"]
mod tests;

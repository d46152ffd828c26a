//! Shared fixtures: contexts over in-memory backends and a fault-injecting backend.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::*;
use crate::backend::{BackendError, MemoryBackend};

/// Defaults with every sleep shortened so retries and pauses stay fast.
#[must_use]
pub fn fast_config() -> StoreConfig {
    let mut config = StoreConfig::default();
    config.save.retry_delay_ms = 1;
    config.delete.chunk_pause_ms = 1;
    config.delete.secure_pass_delay_ms = 1;
    config.autosave.retry_delay_ms = 1;
    config.autosave.debounce_ms = 0;
    config.loader.retry_delay_ms = 1;
    config
}

#[must_use]
pub fn memory_context() -> (StoreContext, MemoryBackend) {
    context_with_config(fast_config())
}

#[must_use]
pub fn context_with_config(config: StoreConfig) -> (StoreContext, MemoryBackend) {
    let backend = MemoryBackend::new();
    (StoreContext::new(Arc::new(backend.clone()), config), backend)
}

#[must_use]
pub fn faulty_context() -> (StoreContext, FaultyBackend) {
    faulty_context_with_config(fast_config())
}

#[must_use]
pub fn faulty_context_with_config(config: StoreConfig) -> (StoreContext, FaultyBackend) {
    let backend = FaultyBackend::default();
    (StoreContext::new(Arc::new(backend.clone()), config), backend)
}

// =============================================================================
// FAULTY BACKEND
// =============================================================================

#[derive(Default)]
struct Faults {
    transient_set_failures: usize,
    transient_get_failures: HashMap<String, usize>,
    broken_keys: HashSet<String>,
    broken_removals: HashSet<String>,
    /// One-shot direct writes `(trigger prefix, key, value)` applied after a
    /// write to a key with the trigger prefix.
    interleaved: Vec<(String, String, String)>,
    mangled_keys: HashSet<String>,
    get_delay: Option<Duration>,
    set_counts: HashMap<String, usize>,
}

/// In-memory backend with injectable failures and a per-key write counter.
#[derive(Clone, Default)]
pub struct FaultyBackend {
    inner: MemoryBackend,
    faults: Arc<Mutex<Faults>>,
}

impl FaultyBackend {
    fn faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The next `n` writes fail with a retryable error.
    pub fn fail_next_sets(&self, n: usize) {
        self.faults().transient_set_failures = n;
    }

    /// Every write to `key` fails with a non-retryable error.
    pub fn break_key(&self, key: &str) {
        self.faults().broken_keys.insert(key.to_owned());
    }

    /// The next `n` reads of `key` fail with a retryable error.
    pub fn fail_gets_of(&self, key: &str, n: usize) {
        self.faults().transient_get_failures.insert(key.to_owned(), n);
    }

    /// Every removal of `key` fails with a non-retryable error.
    pub fn break_removal(&self, key: &str) {
        self.faults().broken_removals.insert(key.to_owned());
    }

    /// After the next write to a key starting with `trigger`, write `value`
    /// to `key` directly, as a writer outside the services would.
    pub fn write_after(&self, trigger: &str, key: &str, value: &str) {
        self.faults().interleaved.push((trigger.to_owned(), key.to_owned(), value.to_owned()));
    }

    /// Writes to `key` silently store a different payload.
    pub fn mangle_key(&self, key: &str) {
        self.faults().mangled_keys.insert(key.to_owned());
    }

    pub fn slow_gets(&self, delay: Duration) {
        self.faults().get_delay = Some(delay);
    }

    /// Successful writes of `key` so far.
    pub fn set_count(&self, key: &str) -> usize {
        self.faults().set_counts.get(key).copied().unwrap_or(0)
    }

    pub fn inner(&self) -> &MemoryBackend {
        &self.inner
    }
}

#[async_trait::async_trait]
impl StorageBackend for FaultyBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        let delay = {
            let mut faults = self.faults();
            if let Some(remaining) = faults.transient_get_failures.get_mut(key).filter(|n| **n > 0) {
                *remaining -= 1;
                return Err(BackendError::Unavailable(format!("injected read failure for {key}")));
            }
            faults.get_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), BackendError> {
        let mangle = {
            let mut faults = self.faults();
            if faults.transient_set_failures > 0 {
                faults.transient_set_failures -= 1;
                return Err(BackendError::Unavailable("injected transient failure".into()));
            }
            if faults.broken_keys.contains(key) {
                return Err(BackendError::Corrupt(format!("injected failure for {key}")));
            }
            *faults.set_counts.entry(key.to_owned()).or_insert(0) += 1;
            faults.mangled_keys.contains(key)
        };
        if mangle {
            return self.inner.set(key, &format!("{value}#mangled")).await;
        }
        self.inner.set(key, value).await?;

        let interleaved = {
            let mut faults = self.faults();
            let position = faults.interleaved.iter().position(|(trigger, _, _)| key.starts_with(trigger.as_str()));
            position.map(|i| faults.interleaved.remove(i))
        };
        if let Some((_, other, value)) = interleaved {
            self.inner.set(&other, &value).await?;
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), BackendError> {
        if self.faults().broken_removals.contains(key) {
            return Err(BackendError::Corrupt(format!("injected removal failure for {key}")));
        }
        self.inner.remove(key).await
    }

    async fn keys(&self) -> Result<Vec<String>, BackendError> {
        self.inner.keys().await
    }
}

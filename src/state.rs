//! Shared store state.
//!
//! DESIGN
//! ======
//! `StoreContext` is handed to every service. It holds the backend, the
//! event bus, the per-key lock table and the configuration. Clone is cheap:
//! all fields are Arc-wrapped or Clone.
//!
//! Mutations of one key (save, delete, recovery, log appends) run under that
//! key's async mutex from [`KeyLocks`]. Different keys proceed concurrently.
//! Writes that bypass the services are not serialized.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;

use crate::backend::StorageBackend;
use crate::config::StoreConfig;
use crate::events::EventBus;

// =============================================================================
// KEY LOCKS
// =============================================================================

/// Table of per-key async mutexes. Idle entries are pruned on acquire.
#[derive(Clone, Default)]
pub struct KeyLocks {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl KeyLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`. Not reentrant: acquiring the same
    /// key twice from one task deadlocks.
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Only the table holds an idle mutex; holders and waiters own a clone.
            locks.retain(|_, m| Arc::strong_count(m) > 1);
            Arc::clone(locks.entry(key.to_owned()).or_default())
        };
        lock.lock_owned().await
    }

    /// Number of keys currently tracked (held or awaited).
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

// =============================================================================
// STORE CONTEXT
// =============================================================================

#[derive(Clone)]
pub struct StoreContext {
    pub backend: Arc<dyn StorageBackend>,
    pub events: EventBus,
    pub locks: KeyLocks,
    pub config: Arc<StoreConfig>,
}

impl StoreContext {
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>, config: StoreConfig) -> Self {
        Self { backend, events: EventBus::new(), locks: KeyLocks::new(), config: Arc::new(config) }
    }
}

#[cfg(test)]
#[path = "state_helpers_test.rs"]
pub mod test_helpers;

#[cfg(test)]
#[path = "state_test.rs"]
mod tests;

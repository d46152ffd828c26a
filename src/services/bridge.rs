//! Sync bridge — relays outside changes into the cache and the auto-save queue.
//!
//! DESIGN
//! ======
//! Writes made by another process never pass through the CRUD services, so
//! the host reports them with [`SyncBridge::external_change`]. The bridge
//! drops the stale cached value and re-announces the change on the bus.
//!
//! Connectivity follows the host too: going offline pauses the auto-save
//! queue, coming back online re-enables it and flushes everything pending.
//!
//! A relay task started with [`SyncBridge::spawn_relay`] consumes the bus,
//! counts events by kind, and drops cached values for keys that corruption
//! recovery restored from a backup.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::events::{EventKind, StorageEvent};
use crate::services::autosave::{AutoSaveQueue, FlushSummary};
use crate::services::read::ReadCache;
use crate::state::StoreContext;

/// How an outside write changed a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Save,
    Delete,
    Update,
}

impl ChangeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Save => "save",
            Self::Delete => "delete",
            Self::Update => "update",
        }
    }

    /// Absent and empty values both count as "no value".
    #[must_use]
    pub fn classify(old: Option<&str>, new: Option<&str>) -> Self {
        let had = old.is_some_and(|v| !v.is_empty());
        let has = new.is_some_and(|v| !v.is_empty());
        match (had, has) {
            (false, true) => Self::Save,
            (true, false) => Self::Delete,
            _ => Self::Update,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeStats {
    pub online: bool,
    /// Events seen by the relay, keyed by event name.
    pub events: BTreeMap<String, u64>,
    pub external_changes: u64,
}

#[derive(Clone)]
pub struct SyncBridge {
    ctx: StoreContext,
    cache: ReadCache,
    autosave: AutoSaveQueue,
    stats: Arc<Mutex<BridgeStats>>,
}

impl SyncBridge {
    #[must_use]
    pub fn new(ctx: StoreContext, cache: ReadCache, autosave: AutoSaveQueue) -> Self {
        Self {
            ctx,
            cache,
            autosave,
            stats: Arc::new(Mutex::new(BridgeStats { online: true, ..BridgeStats::default() })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BridgeStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a write to `key` made outside this process. Returns `None` for
    /// an empty key.
    pub fn external_change(&self, key: &str, old: Option<&str>, new: Option<&str>) -> Option<ChangeKind> {
        if key.is_empty() {
            return None;
        }
        let kind = ChangeKind::classify(old, new);
        self.cache.invalidate(key);
        self.lock().external_changes += 1;
        debug!(key, change = kind.as_str(), "external change");

        self.ctx.events.emit(
            StorageEvent::new(EventKind::ExternalChange)
                .with_key(key)
                .with_data("type", kind.as_str())
                .with_data("oldValue", old)
                .with_data("newValue", new),
        );
        Some(kind)
    }

    /// Switch connectivity. Coming online flushes the auto-save queue.
    pub async fn set_online(&self, online: bool) -> FlushSummary {
        self.lock().online = online;
        info!(online, "connectivity changed");

        let summary = if online {
            self.autosave.enable();
            self.autosave.flush_all().await
        } else {
            self.autosave.disable();
            FlushSummary::default()
        };
        self.ctx
            .events
            .emit(StorageEvent::new(EventKind::Connectivity).with_data("online", online));
        summary
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.lock().online
    }

    #[must_use]
    pub fn stats(&self) -> BridgeStats {
        self.lock().clone()
    }

    /// Apply one bus event: count it, and drop cached values that recovery
    /// replaced.
    pub fn handle(&self, event: &StorageEvent) {
        *self.lock().events.entry(event.kind.as_str().to_owned()).or_insert(0) += 1;

        if event.kind == EventKind::DataCorruption {
            let restored = event.data.get("backupFound").and_then(serde_json::Value::as_bool);
            if let (Some(true), Some(key)) = (restored, event.key.as_deref()) {
                debug!(key, "dropping cached value replaced by recovery");
                self.cache.invalidate(key);
            }
        }
    }

    /// Subscribe to the bus now and relay events until the handle is aborted.
    #[must_use]
    pub fn spawn_relay(&self) -> JoinHandle<()> {
        let mut sub = self.ctx.events.subscribe();
        let bridge = self.clone();
        tokio::spawn(async move {
            while let Some(event) = sub.rx.recv().await {
                bridge.handle(&event);
            }
        })
    }
}

#[cfg(test)]
#[path = "bridge_test.rs"]
mod tests;

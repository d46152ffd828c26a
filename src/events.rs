//! Storage events — the notification surface toward external listeners.
//!
//! DESIGN
//! ======
//! Every service reports what it did through one [`EventBus`]. Subscribers
//! receive a bounded `mpsc` channel. Emission is best-effort: a full
//! subscriber misses the event, a closed one is dropped from the bus, and
//! neither case is escalated to the operation that emitted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

// =============================================================================
// TYPES
// =============================================================================

/// Flat key-value payload carried by an event.
pub type Data = HashMap<String, serde_json::Value>;

const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// What kind of thing happened. Serialized names match the event names
/// listeners subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A save, read-visible write, or delete went through the CRUD services.
    StorageChange,
    /// A batch save/read/delete finished.
    BatchCompleted,
    /// Integrity verification detected a mismatch or broken metadata.
    DataCorruption,
    KeyValidationError,
    JsonValidationError,
    /// Auto-save queue status for one key (`queued`, `saved`, `error`).
    AutoSaveUpdate,
    /// A write made outside this process was reported to the bridge.
    ExternalChange,
    Connectivity,
    /// A multi-key load, or one key within it, failed.
    DataLoaderError,
}

impl EventKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StorageChange => "storage_change",
            Self::BatchCompleted => "batch_completed",
            Self::DataCorruption => "data_corruption",
            Self::KeyValidationError => "key_validation_error",
            Self::JsonValidationError => "json_validation_error",
            Self::AutoSaveUpdate => "auto_save_update",
            Self::ExternalChange => "external_change",
            Self::Connectivity => "connectivity",
            Self::DataLoaderError => "data_loader_error",
        }
    }
}

/// Envelope shared by every notification: `{kind, key, ...data, ts}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageEvent {
    pub id: Uuid,
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub data: Data,
    /// Milliseconds since Unix epoch. Set automatically at construction.
    pub ts: i64,
}

/// Current time as milliseconds since Unix epoch.
pub(crate) fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

impl StorageEvent {
    pub fn new(kind: EventKind) -> Self {
        Self { id: Uuid::new_v4(), kind, key: None, data: Data::new(), ts: now_ms() }
    }

    /// `storage_change` with the given action (`save`, `delete`).
    pub fn change(action: &str, key: &str) -> Self {
        Self::new(EventKind::StorageChange)
            .with_key(key)
            .with_data("action", action)
    }

    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Read a string field from the payload.
    #[must_use]
    pub fn str_field(&self, field: &str) -> Option<&str> {
        self.data.get(field).and_then(serde_json::Value::as_str)
    }
}

// =============================================================================
// EVENT BUS
// =============================================================================

/// A live subscription. Dropping the receiver unsubscribes on the next emit.
pub struct Subscription {
    pub id: Uuid,
    pub rx: mpsc::Receiver<StorageEvent>,
}

/// Fan-out of storage events to any number of subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<HashMap<Uuid, mpsc::Sender<StorageEvent>>>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe with the default channel capacity.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        self.subscribe_with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    #[must_use]
    pub fn subscribe_with_capacity(&self, capacity: usize) -> Subscription {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = Uuid::new_v4();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: Uuid) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Deliver an event to every subscriber without waiting.
    pub fn emit(&self, event: StorageEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        debug!(kind = event.kind.as_str(), key = ?event.key, "storage event");

        subscribers.retain(|id, tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(subscriber = %id, kind = event.kind.as_str(), "event subscriber full; dropping event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

#[cfg(test)]
#[path = "events_test.rs"]
mod tests;

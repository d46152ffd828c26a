//! Auto-save queue — debounced, coalescing saves of host input changes.
//!
//! DESIGN
//! ======
//! The host reports input changes through [`AutoSaveQueue::observe`]. Each
//! tracked change replaces the pending value for its storage key and pushes
//! the key's flush time `debounce_ms` into the future, so a burst of edits
//! collapses into one save of the last value.
//!
//! A background worker calls [`AutoSaveQueue::flush_ready`] on a fixed
//! interval and [`AutoSaveQueue::snapshot`] on a slower one. The host calls
//! [`AutoSaveQueue::flush_all`] when it is about to go away.
//!
//! Flushing snapshots pending items without removing them. An item leaves
//! the queue only if its sequence number is unchanged when its save settles,
//! so a change observed mid-flush is never lost.
//!
//! ERROR HANDLING
//! ==============
//! Retryable save failures are retried with `retry_delay_ms * attempt`
//! back-off up to `max_retries`. Exhausted or non-retryable items are
//! dropped, appended to `auto_save_logs`, and reported with an
//! `auto_save_update` event whose status is `error`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::backend::BackendError;
use crate::error::{ErrorCode, StorageError};
use crate::events::{EventKind, StorageEvent, now_ms};
use crate::services::integrity::IntegrityService;
use crate::services::oplog;
use crate::services::save::{SaveOptions, SaveService};
use crate::state::StoreContext;

pub const SNAPSHOT_PREFIX: &str = "autosave_snapshot_";

// =============================================================================
// TYPES
// =============================================================================

/// One input change reported by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputChange {
    pub element_id: String,
    /// Explicit storage key; falls back to `element_id`.
    pub storage_key: Option<String>,
    pub value: Value,
    /// The host marked this input for auto-save.
    pub auto_save: bool,
}

impl InputChange {
    #[must_use]
    pub fn new(element_id: impl Into<String>, value: Value) -> Self {
        Self { element_id: element_id.into(), storage_key: None, value, auto_save: true }
    }

    #[must_use]
    pub fn with_storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn storage_key(&self) -> &str {
        self.storage_key.as_deref().unwrap_or(&self.element_id)
    }
}

/// Decides whether an input change is tracked.
pub type TrackPredicate = Arc<dyn Fn(&InputChange) -> bool + Send + Sync>;

/// Where a key sits in the queue lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Idle,
    /// Queued, but changed less than `debounce_ms` ago.
    Debouncing,
    Pending,
    Flushing,
    /// The last flush of this key gave up.
    Error,
}

/// Public view of the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoSaveState {
    pub enabled: bool,
    pub queue_size: usize,
    /// Key to time of its last successful auto-save.
    pub last_saves: BTreeMap<String, i64>,
}

/// Entry of `auto_save_logs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoSaveLogEntry {
    pub key: String,
    pub error: String,
    pub timestamp: i64,
}

/// Result of one flush pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushSummary {
    pub saved: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone)]
struct QueueItem {
    value: Value,
    timestamp: i64,
    ready_at: i64,
    seq: u64,
    retry_count: u32,
}

#[derive(Default)]
struct QueueState {
    enabled: bool,
    queue: HashMap<String, QueueItem>,
    flushing: HashSet<String>,
    failed: HashSet<String>,
    /// Latest observed value per key, kept after flushing for snapshots.
    tracked: BTreeMap<String, Value>,
    last_saves: BTreeMap<String, i64>,
    next_seq: u64,
}

// =============================================================================
// QUEUE
// =============================================================================

#[derive(Clone)]
pub struct AutoSaveQueue {
    ctx: StoreContext,
    saver: SaveService,
    integrity: IntegrityService,
    state: Arc<Mutex<QueueState>>,
    predicate: TrackPredicate,
    /// Serializes flush passes so one item is never saved twice at once.
    flush_gate: Arc<tokio::sync::Mutex<()>>,
}

impl AutoSaveQueue {
    /// A queue that starts enabled and tracks changes with `auto_save` set.
    #[must_use]
    pub fn new(ctx: StoreContext, saver: SaveService) -> Self {
        Self {
            integrity: IntegrityService::new(ctx.clone()),
            ctx,
            saver,
            state: Arc::new(Mutex::new(QueueState { enabled: true, ..QueueState::default() })),
            predicate: Arc::new(|change: &InputChange| change.auto_save),
            flush_gate: Arc::default(),
        }
    }

    #[must_use]
    pub fn with_predicate(mut self, predicate: impl Fn(&InputChange) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Arc::new(predicate);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, key: &str, status: &str, error: Option<String>) {
        self.ctx.events.emit(
            StorageEvent::new(EventKind::AutoSaveUpdate)
                .with_key(key)
                .with_data("status", status)
                .with_data("error", error)
                .with_data("timestamp", now_ms()),
        );
    }

    /// Queue `change` if it is tracked. Returns whether it was queued.
    pub async fn observe(&self, change: InputChange) -> bool {
        if !(self.predicate)(&change) {
            return false;
        }
        let full = {
            let state = self.lock();
            if !state.enabled {
                return false;
            }
            state.queue.len() >= self.ctx.config.autosave.max_queue_size.max(1)
        };
        if full {
            info!("auto-save queue full; flushing before queueing");
            self.flush_all().await;
        }

        let key = change.storage_key().to_owned();
        {
            let mut state = self.lock();
            let now = now_ms();
            state.next_seq += 1;
            let seq = state.next_seq;
            let retry_count = state.queue.get(&key).map_or(0, |item| item.retry_count);
            state.tracked.insert(key.clone(), change.value.clone());
            state.failed.remove(&key);
            state.queue.insert(
                key.clone(),
                QueueItem {
                    value: change.value,
                    timestamp: now,
                    ready_at: now + self.ctx.config.autosave.debounce_ms,
                    seq,
                    retry_count,
                },
            );
        }
        debug!(key = %key, "auto-save queued");
        self.notify(&key, "queued", None);
        true
    }

    /// Save every item whose debounce window has passed. No-op while disabled.
    pub async fn flush_ready(&self) -> FlushSummary {
        if !self.is_enabled() {
            return FlushSummary::default();
        }
        self.flush(false).await
    }

    /// Save every queued item now, debounced or not.
    pub async fn flush_all(&self) -> FlushSummary {
        self.flush(true).await
    }

    async fn flush(&self, everything: bool) -> FlushSummary {
        let _gate = self.flush_gate.lock().await;

        // PHASE: SNAPSHOT READY ITEMS
        let batch: Vec<(String, QueueItem)> = {
            let mut state = self.lock();
            let now = now_ms();
            let ready: Vec<(String, QueueItem)> = state
                .queue
                .iter()
                .filter(|(_, item)| everything || item.ready_at <= now)
                .map(|(key, item)| (key.clone(), item.clone()))
                .collect();
            for (key, _) in &ready {
                state.flushing.insert(key.clone());
            }
            ready
        };

        let mut summary = FlushSummary::default();
        for (key, item) in batch {
            match self.save_with_retry(&key, &item).await {
                Ok(()) => {
                    {
                        let mut state = self.lock();
                        state.flushing.remove(&key);
                        state.last_saves.insert(key.clone(), now_ms());
                        Self::ack(&mut state, &key, item.seq);
                    }
                    self.notify(&key, "saved", None);
                    summary.saved.push(key);
                }
                Err(e) => {
                    error!(key = %key, error = %e, code = e.error_code(), "auto-save gave up");
                    {
                        let mut state = self.lock();
                        state.flushing.remove(&key);
                        if Self::ack(&mut state, &key, item.seq) {
                            state.failed.insert(key.clone());
                        }
                    }
                    let entry = AutoSaveLogEntry { key: key.clone(), error: e.to_string(), timestamp: now_ms() };
                    oplog::append(&self.ctx, oplog::AUTOSAVE_LOG, &entry).await;
                    self.notify(&key, "error", Some(e.to_string()));
                    summary.failed.push(key);
                }
            }
        }
        if !summary.saved.is_empty() || !summary.failed.is_empty() {
            info!(saved = summary.saved.len(), failed = summary.failed.len(), "auto-save flush finished");
        }
        summary
    }

    /// Drop `key` from the queue if it still holds the flushed item.
    fn ack(state: &mut QueueState, key: &str, seq: u64) -> bool {
        // EDGE: a newer change observed mid-flush stays queued.
        let current = state.queue.get(key).map(|item| item.seq);
        if current == Some(seq) {
            state.queue.remove(key);
            true
        } else {
            false
        }
    }

    async fn save_with_retry(&self, key: &str, item: &QueueItem) -> Result<(), StorageError> {
        let config = self.ctx.config.autosave;
        let mut attempt = item.retry_count + 1;
        loop {
            match self.saver.save_item(key, &item.value, &SaveOptions::default()).await {
                Ok(_) => return Ok(()),
                Err(e) if e.retryable() && attempt <= config.max_retries => {
                    warn!(key, attempt, total = config.max_retries, error = %e, "auto-save failed; retrying");
                    if let Some(queued) = self.lock().queue.get_mut(key).filter(|q| q.seq == item.seq) {
                        queued.retry_count = attempt;
                    }
                    tokio::time::sleep(Duration::from_millis(config.retry_delay_ms * u64::from(attempt))).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Save every tracked value as one snapshot record and prune old ones.
    /// Returns the snapshot key, or `None` when nothing is tracked.
    ///
    /// # Errors
    ///
    /// Propagates the save failure, or a backend error from pruning.
    pub async fn snapshot(&self) -> Result<Option<String>, StorageError> {
        let tracked = self.lock().tracked.clone();
        if tracked.is_empty() {
            return Ok(None);
        }

        // Strictly newer than every stored snapshot, so pruning never takes it.
        let newest = self.stored_snapshots().await?.last().map_or(i64::MIN, |(ts, _)| *ts);
        let timestamp = now_ms().max(newest.saturating_add(1));
        let key = snapshot_key(timestamp);
        let body = json!({ "timestamp": timestamp, "data": tracked });
        let opts = SaveOptions { create_backup: false, ..SaveOptions::default() };
        self.saver.save_item(&key, &body, &opts).await?;

        let pruned = self.prune_snapshots().await?;
        info!(key = %key, entries = tracked.len(), pruned, "auto-save snapshot written");
        Ok(Some(key))
    }

    async fn prune_snapshots(&self) -> Result<usize, StorageError> {
        let mut snapshots = self.stored_snapshots().await?;
        let keep = self.ctx.config.autosave.max_snapshots;
        let excess = snapshots.len().saturating_sub(keep);
        for (_, key) in snapshots.drain(..excess) {
            let _guard = self.ctx.locks.acquire(&key).await;
            self.ctx.backend.remove(&key).await?;
            self.integrity.forget(&key).await?;
        }
        Ok(excess)
    }

    /// Stored snapshots with their timestamps, oldest first.
    async fn stored_snapshots(&self) -> Result<Vec<(i64, String)>, BackendError> {
        let mut snapshots: Vec<(i64, String)> = self
            .ctx
            .backend
            .keys_with_prefix(SNAPSHOT_PREFIX)
            .await?
            .into_iter()
            .filter_map(|key| {
                let ts = key.strip_prefix(SNAPSHOT_PREFIX)?.parse::<i64>();
                match ts {
                    Ok(ts) => Some((ts, key)),
                    Err(_) => None,
                }
            })
            .collect();
        snapshots.sort();
        Ok(snapshots)
    }

    /// Snapshot keys currently stored, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] if the keys cannot be listed.
    pub async fn snapshots(&self) -> Result<Vec<String>, BackendError> {
        Ok(self.stored_snapshots().await?.into_iter().map(|(_, key)| key).collect())
    }

    // =========================================================================
    // CONTROL & INSPECTION
    // =========================================================================

    pub fn enable(&self) {
        self.lock().enabled = true;
        info!("auto-save enabled");
    }

    /// Stop accepting changes and pause periodic flushes. Queued items stay.
    pub fn disable(&self) {
        self.lock().enabled = false;
        info!("auto-save disabled");
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    /// Drop a pending item. Returns whether one was queued.
    pub fn cancel(&self, key: &str) -> bool {
        let removed = self.lock().queue.remove(key).is_some();
        if removed {
            debug!(key, "auto-save cancelled");
        }
        removed
    }

    #[must_use]
    pub fn status(&self, key: &str) -> ItemStatus {
        let state = self.lock();
        if state.flushing.contains(key) {
            return ItemStatus::Flushing;
        }
        match state.queue.get(key) {
            Some(item) if item.ready_at > now_ms() => ItemStatus::Debouncing,
            Some(_) => ItemStatus::Pending,
            None if state.failed.contains(key) => ItemStatus::Error,
            None => ItemStatus::Idle,
        }
    }

    /// Time the pending value for `key` was observed.
    #[must_use]
    pub fn queued_at(&self, key: &str) -> Option<i64> {
        self.lock().queue.get(key).map(|item| item.timestamp)
    }

    #[must_use]
    pub fn state(&self) -> AutoSaveState {
        let state = self.lock();
        AutoSaveState { enabled: state.enabled, queue_size: state.queue.len(), last_saves: state.last_saves.clone() }
    }

    /// # Errors
    ///
    /// Returns a [`BackendError`] if the log cannot be read.
    pub async fn error_logs(&self) -> Result<Vec<AutoSaveLogEntry>, BackendError> {
        oplog::typed_entries(&self.ctx, oplog::AUTOSAVE_LOG).await
    }
}

fn snapshot_key(timestamp: i64) -> String {
    format!("{SNAPSHOT_PREFIX}{timestamp}")
}

// =============================================================================
// WORKER
// =============================================================================

/// Spawn the background flush/snapshot task. Returns a handle for shutdown.
pub fn spawn_autosave_worker(queue: AutoSaveQueue) -> JoinHandle<()> {
    let config = queue.ctx.config.autosave;
    let flush_every = Duration::from_millis(config.flush_interval_ms.max(1));
    let snapshot_every = Duration::from_millis(config.snapshot_interval_ms.max(1));
    info!(
        flush_interval_ms = config.flush_interval_ms,
        snapshot_interval_ms = config.snapshot_interval_ms,
        debounce_ms = config.debounce_ms,
        "auto-save worker configured"
    );

    tokio::spawn(async move {
        let mut flush_ticker = tokio::time::interval_at(Instant::now() + flush_every, flush_every);
        flush_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut snapshot_ticker = tokio::time::interval_at(Instant::now() + snapshot_every, snapshot_every);
        snapshot_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = flush_ticker.tick() => {
                    queue.flush_ready().await;
                }
                _ = snapshot_ticker.tick() => {
                    if let Err(e) = queue.snapshot().await {
                        warn!(error = %e, "auto-save snapshot failed");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
#[path = "autosave_test.rs"]
mod tests;

//! Storage facade — one handle wiring every service to one backend.
//!
//! DESIGN
//! ======
//! `Storage` owns a [`StoreContext`] and one [`ReadCache`] shared by the
//! save, read, delete and load services, so a write drops the cached value the
//! next read would otherwise serve. The plain CRUD methods use default
//! options; the `*_with` variants take them explicitly.
//!
//! Background work (auto-save flushes, snapshots, the bus relay) starts only
//! when [`Storage::start`] is called.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::info;

use crate::backend::{BackendError, FileBackend, MemoryBackend, StorageBackend};
use crate::config::StoreConfig;
use crate::error::StorageError;
use crate::events::{EventBus, Subscription};
use crate::services::autosave::{self, AutoSaveQueue, FlushSummary};
use crate::services::backup::Backups;
use crate::services::batch::BatchReport;
use crate::services::bridge::SyncBridge;
use crate::services::delete::{DeleteOptions, DeleteReceipt, DeleteService};
use crate::services::integrity::{IntegrityService, Verification};
use crate::services::json::JsonValidator;
use crate::services::keys::{KeyOptions, KeyValidator};
use crate::services::loader::{DataLoader, LoadOptions, Loaded};
use crate::services::read::{ReadCache, ReadOptions, ReadResult, ReadService};
use crate::services::save::{SaveItem, SaveOptions, SaveReceipt, SaveService};
use crate::state::StoreContext;

/// Handles of the background tasks started by [`Storage::start`].
pub struct Workers {
    pub autosave: JoinHandle<()>,
    pub relay: JoinHandle<()>,
}

impl Workers {
    pub fn abort(&self) {
        self.autosave.abort();
        self.relay.abort();
    }
}

#[derive(Clone)]
pub struct Storage {
    ctx: StoreContext,
    cache: ReadCache,
    saver: SaveService,
    reader: ReadService,
    deleter: DeleteService,
    loader: DataLoader,
    keys: KeyValidator,
    json: JsonValidator,
    integrity: IntegrityService,
    backups: Backups,
    autosave: AutoSaveQueue,
    bridge: SyncBridge,
}

impl Storage {
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>, config: StoreConfig) -> Self {
        let cache = ReadCache::new(config.read.cache_ttl_ms, config.read.cache_max_entries);
        let ctx = StoreContext::new(backend, config);
        let saver = SaveService::new(ctx.clone(), cache.clone());
        let autosave = AutoSaveQueue::new(ctx.clone(), saver.clone());
        Self {
            reader: ReadService::new(ctx.clone(), cache.clone()),
            deleter: DeleteService::new(ctx.clone(), cache.clone()),
            loader: DataLoader::new(ctx.clone(), cache.clone()),
            keys: KeyValidator::new(ctx.clone()),
            json: JsonValidator::new(ctx.clone()),
            integrity: IntegrityService::new(ctx.clone()),
            backups: Backups::new(ctx.clone()),
            bridge: SyncBridge::new(ctx.clone(), cache.clone(), autosave.clone()),
            autosave,
            saver,
            cache,
            ctx,
        }
    }

    /// Empty in-memory store with default configuration.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()), StoreConfig::default())
    }

    /// Store backed by the JSON file at `path`.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] if the file exists but cannot be loaded.
    pub async fn open_file(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self, BackendError> {
        let backend = FileBackend::open(path).await?;
        Ok(Self::new(Arc::new(backend), config))
    }

    /// Spawn the auto-save worker and the bus relay.
    #[must_use]
    pub fn start(&self) -> Workers {
        info!("storage background workers starting");
        Workers { autosave: autosave::spawn_autosave_worker(self.autosave.clone()), relay: self.bridge.spawn_relay() }
    }

    /// Flush everything the auto-save queue still holds.
    pub async fn shutdown(&self) -> FlushSummary {
        let summary = self.autosave.flush_all().await;
        info!(saved = summary.saved.len(), failed = summary.failed.len(), "storage shut down");
        summary
    }

    // =========================================================================
    // CRUD
    // =========================================================================

    /// # Errors
    ///
    /// See [`SaveService::save_item`].
    pub async fn save_item(&self, key: &str, data: &Value) -> Result<SaveReceipt, StorageError> {
        self.saver.save_item(key, data, &SaveOptions::default()).await
    }

    /// # Errors
    ///
    /// See [`SaveService::save_item`].
    pub async fn save_item_with(&self, key: &str, data: &Value, opts: &SaveOptions) -> Result<SaveReceipt, StorageError> {
        self.saver.save_item(key, data, opts).await
    }

    /// The parsed value stored under `key`.
    ///
    /// # Errors
    ///
    /// See [`ReadService::read_item`].
    pub async fn read_item(&self, key: &str) -> Result<Value, StorageError> {
        Ok(self.reader.read_item(key, &ReadOptions::default()).await?.data)
    }

    /// # Errors
    ///
    /// See [`ReadService::read_item`].
    pub async fn read_item_with(&self, key: &str, opts: &ReadOptions) -> Result<ReadResult, StorageError> {
        self.reader.read_item(key, opts).await
    }

    /// # Errors
    ///
    /// See [`DeleteService::delete_item`].
    pub async fn delete_item(&self, key: &str) -> Result<DeleteReceipt, StorageError> {
        self.deleter.delete_item(key, &DeleteOptions::default()).await
    }

    /// # Errors
    ///
    /// See [`DeleteService::delete_item`].
    pub async fn delete_item_with(&self, key: &str, opts: &DeleteOptions) -> Result<DeleteReceipt, StorageError> {
        self.deleter.delete_item(key, opts).await
    }

    pub async fn batch_save(&self, items: Vec<SaveItem>) -> BatchReport<SaveReceipt> {
        self.saver.batch_save(items, &SaveOptions::default()).await
    }

    pub async fn batch_read(&self, keys: Vec<String>) -> BatchReport<ReadResult> {
        self.reader.batch_read(keys, &ReadOptions::default()).await
    }

    pub async fn batch_delete(&self, keys: Vec<String>) -> BatchReport<DeleteReceipt> {
        self.deleter.batch_delete(keys, &DeleteOptions::default()).await
    }

    /// Load several keys at once, retrying transient failures.
    ///
    /// # Errors
    ///
    /// See [`DataLoader::load`].
    pub async fn load(&self, keys: &[String]) -> Result<Loaded, StorageError> {
        self.loader.load(keys, &LoadOptions::default()).await
    }

    /// Check the stored payload of `key` against its checksum, recovering
    /// from a backup on mismatch.
    ///
    /// # Errors
    ///
    /// `InvalidKey`, `KeyNotFound`, or a wrapped backend/integrity error.
    pub async fn verify(&self, key: &str) -> Result<Verification, StorageError> {
        self.keys.validate(key, &KeyOptions::storage()).await?;
        let _guard = self.ctx.locks.acquire(key).await;
        let Some(raw) = self.ctx.backend.get(key).await? else {
            return Err(StorageError::KeyNotFound(key.to_owned()));
        };
        let outcome = self.integrity.verify(key, &raw).await?;
        if !outcome.is_valid() {
            self.cache.invalidate(key);
        }
        Ok(outcome)
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    #[must_use]
    pub fn context(&self) -> &StoreContext {
        &self.ctx
    }

    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.ctx.events
    }

    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        self.ctx.events.subscribe()
    }

    #[must_use]
    pub fn cache(&self) -> &ReadCache {
        &self.cache
    }

    #[must_use]
    pub fn saver(&self) -> &SaveService {
        &self.saver
    }

    #[must_use]
    pub fn reader(&self) -> &ReadService {
        &self.reader
    }

    #[must_use]
    pub fn deleter(&self) -> &DeleteService {
        &self.deleter
    }

    #[must_use]
    pub fn loader(&self) -> &DataLoader {
        &self.loader
    }

    #[must_use]
    pub fn keys(&self) -> &KeyValidator {
        &self.keys
    }

    #[must_use]
    pub fn json(&self) -> &JsonValidator {
        &self.json
    }

    #[must_use]
    pub fn integrity(&self) -> &IntegrityService {
        &self.integrity
    }

    #[must_use]
    pub fn backups(&self) -> &Backups {
        &self.backups
    }

    #[must_use]
    pub fn autosave(&self) -> &AutoSaveQueue {
        &self.autosave
    }

    #[must_use]
    pub fn bridge(&self) -> &SyncBridge {
        &self.bridge
    }
}

#[cfg(test)]
#[path = "store_test.rs"]
mod tests;

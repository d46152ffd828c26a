//! Backup records — timestamped pre-mutation copies of stored payloads.
//!
//! DESIGN
//! ======
//! A backup of `key` lives at `backup_<key>_<ms>` and is never rewritten.
//! Only keys whose suffix after `backup_<key>_` is all digits belong to
//! `key`, so `backup_a_1_<ms>` (a backup of `a_1`) is never taken for a
//! backup of `a`. Callers hold the key's lock while creating backups.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::BackendError;
use crate::events::now_ms;
use crate::state::StoreContext;

pub const BACKUP_PREFIX: &str = "backup_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    PreSave,
    PreDelete,
    /// Raw payload written before backups carried an envelope.
    Legacy,
}

/// Envelope stored under a backup key. `value` is the raw stored payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub original_key: String,
    pub value: String,
    pub timestamp: i64,
    pub backup_type: BackupKind,
    pub original_size: usize,
}

impl BackupRecord {
    /// Decode a backup payload, accepting legacy raw payloads.
    #[must_use]
    pub fn decode(original_key: &str, timestamp: i64, raw: String) -> Self {
        match serde_json::from_str::<Self>(&raw) {
            Ok(record) => record,
            Err(_) => Self {
                original_key: original_key.to_owned(),
                original_size: raw.len(),
                value: raw,
                timestamp,
                backup_type: BackupKind::Legacy,
            },
        }
    }
}

#[must_use]
pub fn backup_key(key: &str, timestamp: i64) -> String {
    format!("{BACKUP_PREFIX}{key}_{timestamp}")
}

#[derive(Clone)]
pub struct Backups {
    ctx: StoreContext,
}

impl Backups {
    #[must_use]
    pub fn new(ctx: StoreContext) -> Self {
        Self { ctx }
    }

    /// Write a backup of `raw` for `key` and prune old ones. Returns the backup key.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] if the backup cannot be written. Pruning
    /// failures are logged, not returned.
    pub async fn create(&self, key: &str, raw: &str, kind: BackupKind) -> Result<String, BackendError> {
        // Strictly newer than every existing backup of this key.
        let newest = self.list(key).await?.last().map_or(i64::MIN, |(ts, _)| *ts);
        let timestamp = now_ms().max(newest.saturating_add(1));
        let record = BackupRecord {
            original_key: key.to_owned(),
            value: raw.to_owned(),
            timestamp,
            backup_type: kind,
            original_size: raw.len(),
        };
        let body = serde_json::to_string(&record).map_err(|e| BackendError::Corrupt(e.to_string()))?;
        let target = backup_key(key, timestamp);
        self.ctx.backend.set(&target, &body).await?;
        debug!(key, backup_key = %target, "backup written");

        if let Err(e) = self.prune(key).await {
            warn!(key, error = %e, "backup pruning failed");
        }
        Ok(target)
    }

    /// Backups of exactly `key` as `(timestamp, backup_key)`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] if the key listing fails.
    pub async fn list(&self, key: &str) -> Result<Vec<(i64, String)>, BackendError> {
        let prefix = format!("{BACKUP_PREFIX}{key}_");
        let mut found: Vec<(i64, String)> = self
            .ctx
            .backend
            .keys_with_prefix(&prefix)
            .await?
            .into_iter()
            .filter_map(|k| {
                let suffix = &k[prefix.len()..];
                if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                match suffix.parse::<i64>() {
                    Ok(ts) => Some((ts, k)),
                    Err(_) => None,
                }
            })
            .collect();
        found.sort();
        Ok(found)
    }

    /// The most recent readable backup of `key`.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] if the backend cannot be read.
    pub async fn latest(&self, key: &str) -> Result<Option<(String, BackupRecord)>, BackendError> {
        for (timestamp, backup) in self.list(key).await?.into_iter().rev() {
            if let Some(raw) = self.ctx.backend.get(&backup).await? {
                return Ok(Some((backup, BackupRecord::decode(key, timestamp, raw))));
            }
        }
        Ok(None)
    }

    /// Drop the oldest backups beyond the per-key retention.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] if listing or removal fails.
    pub async fn prune(&self, key: &str) -> Result<usize, BackendError> {
        let keep = self.ctx.config.integrity.max_backups_per_key.max(1);
        let all = self.list(key).await?;
        if all.len() <= keep {
            return Ok(0);
        }
        let excess = all.len() - keep;
        for (_, backup) in &all[..excess] {
            self.ctx.backend.remove(backup).await?;
        }
        debug!(key, removed = excess, "old backups pruned");
        Ok(excess)
    }
}

#[cfg(test)]
#[path = "backup_test.rs"]
mod tests;

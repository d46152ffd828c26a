//! Diagnostic logs — capped JSON arrays persisted in the backend.
//!
//! DESIGN
//! ======
//! Each log is one backend key holding a JSON array. Appends read the array,
//! push, evict the oldest entries beyond the cap and write it back, under a
//! per-log lock so concurrent appends are not lost. Log locks live in their
//! own namespace: a CRUD operation holding an entry's lock can still log.
//!
//! ERROR HANDLING
//! ==============
//! Logging never fails the operation being logged. Backend errors are
//! reported with `warn!` and dropped; an undecodable log is replaced.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::backend::BackendError;
use crate::events::now_ms;
use crate::state::StoreContext;

pub const SAVE_LOG: &str = "save_operations_log";
pub const READ_LOG: &str = "read_operations_log";
pub const DELETE_LOG: &str = "delete_operations_log";
pub const KEY_VALIDATION_LOG: &str = "key_validation_logs";
pub const JSON_VALIDATION_LOG: &str = "json_validation_logs";
pub const CORRUPTION_LOG: &str = "corruption_logs";
pub const AUTOSAVE_LOG: &str = "auto_save_logs";
pub const DATA_LOADER_LOG: &str = "data_loader_logs";

/// Keys the store uses for its own bookkeeping.
pub const ALL_LOGS: [&str; 8] = [
    SAVE_LOG,
    READ_LOG,
    DELETE_LOG,
    KEY_VALIDATION_LOG,
    JSON_VALIDATION_LOG,
    CORRUPTION_LOG,
    AUTOSAVE_LOG,
    DATA_LOADER_LOG,
];

/// Whether `key` names one of the store's logs, ignoring case.
#[must_use]
pub fn is_log_key(key: &str) -> bool {
    ALL_LOGS.iter().any(|log| log.eq_ignore_ascii_case(key))
}

fn lock_key(log_key: &str) -> String {
    format!("\u{0}log:{log_key}")
}

/// One CRUD operation outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationLogEntry {
    pub key: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    pub timestamp: i64,
}

impl OperationLogEntry {
    #[must_use]
    pub fn succeeded(key: &str) -> Self {
        Self { key: key.to_owned(), success: true, error: None, timestamp: now_ms() }
    }

    #[must_use]
    pub fn failed(key: &str, error: impl ToString) -> Self {
        Self { key: key.to_owned(), success: false, error: Some(error.to_string()), timestamp: now_ms() }
    }
}

/// Append `entry` to the log stored under `log_key`, best effort.
pub async fn append(ctx: &StoreContext, log_key: &str, entry: &impl Serialize) {
    let value = match serde_json::to_value(entry) {
        Ok(v) => v,
        Err(e) => {
            warn!(log = log_key, error = %e, "log entry not serializable; skipping");
            return;
        }
    };
    if let Err(e) = try_append(ctx, log_key, value).await {
        warn!(log = log_key, error = %e, "log append failed");
    }
}

async fn try_append(ctx: &StoreContext, log_key: &str, value: Value) -> Result<(), BackendError> {
    let _guard = ctx.locks.acquire(&lock_key(log_key)).await;
    let mut log = load(ctx, log_key).await?;
    log.push(value);
    let cap = ctx.config.log_cap.max(1);
    if log.len() > cap {
        let excess = log.len() - cap;
        log.drain(..excess);
    }
    let body = serde_json::to_string(&log).map_err(|e| BackendError::Corrupt(e.to_string()))?;
    ctx.backend.set(log_key, &body).await
}

async fn load(ctx: &StoreContext, log_key: &str) -> Result<Vec<Value>, BackendError> {
    let Some(raw) = ctx.backend.get(log_key).await? else {
        return Ok(Vec::new());
    };
    match serde_json::from_str::<Vec<Value>>(&raw) {
        Ok(log) => Ok(log),
        Err(e) => {
            warn!(log = log_key, error = %e, "log is not a JSON array; starting fresh");
            Ok(Vec::new())
        }
    }
}

/// Every entry of a log, oldest first.
///
/// # Errors
///
/// Returns a [`BackendError`] if the log cannot be read.
pub async fn entries(ctx: &StoreContext, log_key: &str) -> Result<Vec<Value>, BackendError> {
    load(ctx, log_key).await
}

/// Entries decoded as `T`; entries of another shape are skipped.
///
/// # Errors
///
/// Returns a [`BackendError`] if the log cannot be read.
pub async fn typed_entries<T>(ctx: &StoreContext, log_key: &str) -> Result<Vec<T>, BackendError>
where
    T: for<'de> Deserialize<'de>,
{
    Ok(load(ctx, log_key)
        .await?
        .into_iter()
        .filter_map(|v| match serde_json::from_value(v) {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!(log = log_key, error = %e, "skipping log entry of unexpected shape");
                None
            }
        })
        .collect())
}

#[cfg(test)]
#[path = "oplog_test.rs"]
mod tests;

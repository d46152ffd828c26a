//! Key validator — naming rules for storage keys.
//!
//! DESIGN
//! ======
//! Rules run in a fixed order and stop at the first failure: length,
//! characters, reserved prefix, namespace shape, duplicate. The pure part
//! ([`check_key`]) needs no backend; [`KeyValidator::validate`] adds the
//! duplicate lookup plus logging and notification of failures.
//!
//! Reserved prefixes and the store's log names are matched case-insensitively. The namespace separator
//! is only a legal character when namespacing is enforced.

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::BackendError;
use crate::config::KeyRules;
use crate::error::ErrorCode;
use crate::events::{EventKind, StorageEvent, now_ms};
use crate::services::oplog;
use crate::state::StoreContext;

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const UNIQUE_SUFFIX_LEN: usize = 5;

// =============================================================================
// ERROR
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("key is empty")]
    Empty,
    #[error("key length {len} outside {min}..={max}")]
    InvalidLength { len: usize, min: usize, max: usize },
    #[error("key contains invalid characters: {0:?}")]
    InvalidCharacters(String),
    #[error("key uses reserved prefix {0}")]
    ReservedPrefix(String),
    #[error("key names a store log: {0}")]
    ReservedName(String),
    #[error("invalid namespace format: {0}")]
    InvalidNamespace(String),
    #[error("namespace depth {depth} exceeds {max}")]
    NamespaceTooDeep { depth: usize, max: usize },
    #[error("key already exists: {0}")]
    Duplicate(String),
    #[error("duplicate check failed: {0}")]
    Lookup(String),
}

impl ErrorCode for KeyError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Empty => "E_KEY_EMPTY",
            Self::InvalidLength { .. } => "E_KEY_LENGTH_INVALID",
            Self::InvalidCharacters(_) => "E_INVALID_CHARACTERS_IN_KEY",
            Self::ReservedPrefix(_) => "E_RESERVED_PREFIX_USED",
            Self::ReservedName(_) => "E_RESERVED_NAME_USED",
            Self::InvalidNamespace(_) => "E_INVALID_NAMESPACE_FORMAT",
            Self::NamespaceTooDeep { .. } => "E_NAMESPACE_DEPTH_EXCEEDED",
            Self::Duplicate(_) => "E_KEY_ALREADY_EXISTS",
            Self::Lookup(_) => "E_KEY_LOOKUP_FAILED",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Lookup(_))
    }
}

// =============================================================================
// OPTIONS
// =============================================================================

/// Per-call switches. Length overrides replace the configured bounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyOptions {
    pub allow_reserved: bool,
    pub check_duplicate: bool,
    pub enforce_namespace: bool,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
}

impl KeyOptions {
    /// Options used by the CRUD services: any non-empty key up to the max length.
    #[must_use]
    pub fn storage() -> Self {
        Self { min_length: Some(1), ..Self::default() }
    }
}

// =============================================================================
// PURE RULES
// =============================================================================

fn is_allowed_char(c: char, rules: &KeyRules, namespaced: bool) -> bool {
    c.is_ascii_alphanumeric() || rules.extra_chars.contains(c) || (namespaced && c == rules.namespace_separator)
}

fn invalid_chars(s: &str, rules: &KeyRules, namespaced: bool) -> String {
    s.chars().filter(|c| !is_allowed_char(*c, rules, namespaced)).collect()
}

/// Apply every rule except the duplicate lookup.
///
/// # Errors
///
/// Returns the first [`KeyError`] encountered.
pub fn check_key(key: &str, rules: &KeyRules, opts: &KeyOptions) -> Result<(), KeyError> {
    if key.is_empty() {
        return Err(KeyError::Empty);
    }

    let min = opts.min_length.unwrap_or(rules.min_length);
    let max = opts.max_length.unwrap_or(rules.max_length);
    let len = key.chars().count();
    if len < min || len > max {
        return Err(KeyError::InvalidLength { len, min, max });
    }

    let bad = invalid_chars(key, rules, opts.enforce_namespace);
    if !bad.is_empty() {
        return Err(KeyError::InvalidCharacters(bad));
    }

    if !opts.allow_reserved {
        let lowered = key.to_lowercase();
        if let Some(prefix) = rules
            .reserved_prefixes
            .iter()
            .find(|p| lowered.starts_with(p.to_lowercase().as_str()))
        {
            return Err(KeyError::ReservedPrefix(prefix.clone()));
        }
        if oplog::is_log_key(key) {
            return Err(KeyError::ReservedName(key.to_owned()));
        }
    }

    if opts.enforce_namespace {
        check_namespace(key, rules)?;
    }

    Ok(())
}

fn check_namespace(key: &str, rules: &KeyRules) -> Result<(), KeyError> {
    let segments: Vec<&str> = key.split(rules.namespace_separator).collect();
    if segments.len() > rules.max_namespace_depth {
        return Err(KeyError::NamespaceTooDeep { depth: segments.len(), max: rules.max_namespace_depth });
    }
    for segment in segments {
        if segment.is_empty() {
            return Err(KeyError::InvalidNamespace(format!("empty segment in {key}")));
        }
        if !invalid_chars(segment, rules, false).is_empty() {
            return Err(KeyError::InvalidNamespace(format!("invalid segment {segment}")));
        }
    }
    Ok(())
}

/// Trim, lowercase, collapse whitespace runs to `_`, drop anything else
/// outside `[a-z0-9_.-]`.
#[must_use]
pub fn normalize_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut in_whitespace = false;
    for c in key.trim().to_lowercase().chars() {
        if c.is_whitespace() {
            if !in_whitespace {
                out.push('_');
                in_whitespace = true;
            }
            continue;
        }
        in_whitespace = false;
        if c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-' | '.') {
            out.push(c);
        }
    }
    out
}

// =============================================================================
// VALIDATOR
// =============================================================================

/// Aggregate view over every key currently in the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyStats {
    pub total: usize,
    pub by_namespace: BTreeMap<String, usize>,
    pub average_length: f64,
    pub invalid_keys: Vec<String>,
}

#[derive(Clone)]
pub struct KeyValidator {
    ctx: StoreContext,
}

impl KeyValidator {
    #[must_use]
    pub fn new(ctx: StoreContext) -> Self {
        Self { ctx }
    }

    /// Validate `key`, logging and emitting `key_validation_error` on failure.
    ///
    /// # Errors
    ///
    /// Returns the first rule the key breaks.
    pub async fn validate(&self, key: &str, opts: &KeyOptions) -> Result<(), KeyError> {
        let result = self.run_rules(key, opts).await;
        if let Err(err) = &result {
            self.report(key, err).await;
        }
        result
    }

    async fn run_rules(&self, key: &str, opts: &KeyOptions) -> Result<(), KeyError> {
        check_key(key, &self.ctx.config.keys, opts)?;
        if opts.check_duplicate {
            let exists = self
                .ctx
                .backend
                .contains(key)
                .await
                .map_err(|e| KeyError::Lookup(e.to_string()))?;
            if exists {
                return Err(KeyError::Duplicate(key.to_owned()));
            }
        }
        Ok(())
    }

    async fn report(&self, key: &str, err: &KeyError) {
        debug!(key, error = %err, "key rejected");
        let entry = serde_json::json!({
            "key": key,
            "error": err.error_code(),
            "message": err.to_string(),
            "timestamp": now_ms(),
        });
        oplog::append(&self.ctx, oplog::KEY_VALIDATION_LOG, &entry).await;
        self.ctx.events.emit(
            StorageEvent::new(EventKind::KeyValidationError)
                .with_key(key)
                .with_data("error", err.error_code()),
        );
    }

    /// `<prefix>_<ms>_<5 base36 chars>`, truncated to the max key length.
    #[must_use]
    pub fn generate_unique_key(&self, prefix: &str) -> String {
        let mut rng = rand::rng();
        let suffix: String = (0..UNIQUE_SUFFIX_LEN)
            .map(|_| char::from(BASE36[rng.random_range(0..BASE36.len())]))
            .collect();
        let key = format!("{prefix}_{}_{suffix}", now_ms());
        key.chars().take(self.ctx.config.keys.max_length).collect()
    }

    /// Statistics over every stored key. Invalid keys are listed, not logged.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] if the key listing fails.
    pub async fn analyze_keys(&self) -> Result<KeyStats, BackendError> {
        let rules = &self.ctx.config.keys;
        let mut keys = self.ctx.backend.keys().await?;
        keys.sort();

        let mut by_namespace = BTreeMap::new();
        let mut total_len = 0usize;
        let mut invalid_keys = Vec::new();
        for key in &keys {
            let namespace = key.split(rules.namespace_separator).next().unwrap_or_default();
            *by_namespace.entry(namespace.to_owned()).or_insert(0) += 1;
            total_len += key.chars().count();
            if check_key(key, rules, &KeyOptions::default()).is_err() {
                invalid_keys.push(key.clone());
            }
        }

        #[allow(clippy::cast_precision_loss)]
        let average_length = if keys.is_empty() { 0.0 } else { total_len as f64 / keys.len() as f64 };

        Ok(KeyStats { total: keys.len(), by_namespace, average_length, invalid_keys })
    }

    /// Persisted validation failures, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] if the log cannot be read.
    pub async fn validation_logs(&self) -> Result<Vec<serde_json::Value>, BackendError> {
        oplog::entries(&self.ctx, oplog::KEY_VALIDATION_LOG).await
    }
}

#[cfg(test)]
#[path = "keys_test.rs"]
mod tests;

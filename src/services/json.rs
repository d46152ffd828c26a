//! JSON validator — structural limits on stored values.
//!
//! DESIGN
//! ======
//! Checks run cheapest-first: serialized size, then one walk over the tree
//! (depth, container sizes, repeated containers, number safety), then the
//! optional schema. The root sits at depth 1 and every node, scalar or
//! container, must sit at or above `max_depth`.
//!
//! An owned `serde_json::Value` is a tree, so the repeated-container check
//! cannot fire on values built in Rust. It is kept so the invariant is
//! stated in one place and holds for any future shared representation.
//!
//! ERROR HANDLING
//! ==============
//! The first violation is returned. Every failure is appended to
//! `json_validation_logs` and emitted as `json_validation_error`.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::backend::BackendError;
use crate::config::JsonLimits;
use crate::error::ErrorCode;
use crate::events::{EventKind, StorageEvent, now_ms};
use crate::services::oplog;
use crate::state::StoreContext;

/// Largest integer an IEEE double represents exactly.
const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

// =============================================================================
// ERROR
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JsonError {
    #[error("invalid JSON format: {0}")]
    InvalidFormat(String),
    #[error("serialized size {size} exceeds {max} bytes")]
    TooLarge { size: usize, max: usize },
    #[error("nesting depth exceeds {max}")]
    TooDeep { max: usize },
    #[error("circular reference detected")]
    CircularReference,
    #[error("array length {len} exceeds {max}")]
    ArrayTooLong { len: usize, max: usize },
    #[error("object has {count} keys, max {max}")]
    TooManyKeys { count: usize, max: usize },
    #[error("number {0} cannot be represented exactly")]
    UnsafeNumber(String),
    #[error("schema validation failed: {0}")]
    SchemaViolation(String),
}

impl ErrorCode for JsonError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidFormat(_) => "E_INVALID_JSON_FORMAT",
            Self::TooLarge { .. } | Self::ArrayTooLong { .. } | Self::TooManyKeys { .. } => {
                "E_MAX_LENGTH_EXCEEDED"
            }
            Self::TooDeep { .. } => "E_MAX_DEPTH_EXCEEDED",
            Self::CircularReference => "E_CIRCULAR_REFERENCE_DETECTED",
            Self::UnsafeNumber(_) => "E_INVALID_DATA_TYPE",
            Self::SchemaViolation(_) => "E_SCHEMA_VALIDATION_FAILED",
        }
    }
}

// =============================================================================
// SCHEMA
// =============================================================================

/// Pluggable structural schema, checked after the built-in limits.
pub trait Schema: Send + Sync {
    /// # Errors
    ///
    /// Returns a human-readable description of the first violation.
    fn check(&self, value: &Value) -> Result<(), String>;
}

/// JSON value kinds a [`FieldSchema`] can require.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonKind {
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
    Any,
}

impl JsonKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            Self::Null => value.is_null(),
            Self::Bool => value.is_boolean(),
            Self::Number => value.is_number(),
            Self::String => value.is_string(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
            Self::Any => true,
        }
    }
}

/// Requires an object with the listed top-level fields of the given kinds.
#[derive(Debug, Clone, Default)]
pub struct FieldSchema {
    required: Vec<(String, JsonKind)>,
}

impl FieldSchema {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn require(mut self, field: impl Into<String>, kind: JsonKind) -> Self {
        self.required.push((field.into(), kind));
        self
    }
}

impl Schema for FieldSchema {
    fn check(&self, value: &Value) -> Result<(), String> {
        let Some(object) = value.as_object() else {
            return Err("expected an object".to_owned());
        };
        for (field, kind) in &self.required {
            match object.get(field) {
                None => return Err(format!("missing field {field}")),
                Some(v) if !kind.matches(v) => return Err(format!("field {field} is not {kind:?}")),
                Some(_) => {}
            }
        }
        Ok(())
    }
}

// =============================================================================
// OPTIONS
// =============================================================================

#[derive(Clone)]
pub struct JsonOptions {
    pub schema: Option<Arc<dyn Schema>>,
    pub strict_types: bool,
    pub allow_circular: bool,
    /// Overrides the configured depth limit.
    pub max_depth: Option<usize>,
    /// Overrides the configured serialized size limit.
    pub max_size_bytes: Option<usize>,
}

impl Default for JsonOptions {
    fn default() -> Self {
        Self { schema: None, strict_types: true, allow_circular: false, max_depth: None, max_size_bytes: None }
    }
}

// =============================================================================
// PURE CHECKS
// =============================================================================

struct Walk<'a> {
    limits: JsonLimits,
    opts: &'a JsonOptions,
    seen: HashSet<usize>,
}

impl Walk<'_> {
    fn visit(&mut self, value: &Value, depth: usize) -> Result<(), JsonError> {
        if depth > self.limits.max_depth {
            return Err(JsonError::TooDeep { max: self.limits.max_depth });
        }
        match value {
            Value::Array(items) => {
                self.enter(value)?;
                if items.len() > self.limits.max_array_len {
                    return Err(JsonError::ArrayTooLong { len: items.len(), max: self.limits.max_array_len });
                }
                items.iter().try_for_each(|item| self.visit(item, depth + 1))
            }
            Value::Object(map) => {
                self.enter(value)?;
                if map.len() > self.limits.max_object_keys {
                    return Err(JsonError::TooManyKeys { count: map.len(), max: self.limits.max_object_keys });
                }
                map.values().try_for_each(|item| self.visit(item, depth + 1))
            }
            Value::Number(n) if self.opts.strict_types => check_number(n),
            _ => Ok(()),
        }
    }

    fn enter(&mut self, container: &Value) -> Result<(), JsonError> {
        let address = std::ptr::from_ref(container) as usize;
        if !self.seen.insert(address) && !self.opts.allow_circular {
            return Err(JsonError::CircularReference);
        }
        Ok(())
    }
}

fn check_number(n: &serde_json::Number) -> Result<(), JsonError> {
    let unsafe_int = match (n.as_i64(), n.as_u64()) {
        (Some(i), _) => !(-MAX_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(&i),
        (None, Some(_)) => true,
        (None, None) => false,
    };
    if unsafe_int {
        return Err(JsonError::UnsafeNumber(n.to_string()));
    }
    Ok(())
}

/// Apply every check to an already-parsed value, without logging.
///
/// # Errors
///
/// Returns the first [`JsonError`] encountered.
pub fn check_value(value: &Value, limits: JsonLimits, opts: &JsonOptions) -> Result<(), JsonError> {
    let limits = JsonLimits {
        max_depth: opts.max_depth.unwrap_or(limits.max_depth),
        max_size_bytes: opts.max_size_bytes.unwrap_or(limits.max_size_bytes),
        ..limits
    };

    let serialized = serde_json::to_string(value).map_err(|e| JsonError::InvalidFormat(e.to_string()))?;
    if serialized.len() > limits.max_size_bytes {
        return Err(JsonError::TooLarge { size: serialized.len(), max: limits.max_size_bytes });
    }

    Walk { limits, opts, seen: HashSet::new() }.visit(value, 1)?;

    if let Some(schema) = &opts.schema {
        schema.check(value).map_err(JsonError::SchemaViolation)?;
    }
    Ok(())
}

// =============================================================================
// VALIDATOR
// =============================================================================

#[derive(Clone)]
pub struct JsonValidator {
    ctx: StoreContext,
}

impl JsonValidator {
    #[must_use]
    pub fn new(ctx: StoreContext) -> Self {
        Self { ctx }
    }

    /// Validate a value, logging and emitting `json_validation_error` on failure.
    ///
    /// # Errors
    ///
    /// Returns the first [`JsonError`] encountered.
    pub async fn validate(&self, value: &Value, opts: &JsonOptions) -> Result<(), JsonError> {
        let result = check_value(value, self.ctx.config.json, opts);
        if let Err(err) = &result {
            self.report(err).await;
        }
        result
    }

    /// Validate raw JSON text. Text that does not parse is `InvalidFormat`.
    ///
    /// # Errors
    ///
    /// Returns the first [`JsonError`] encountered.
    pub async fn validate_str(&self, text: &str, opts: &JsonOptions) -> Result<Value, JsonError> {
        let max = opts.max_size_bytes.unwrap_or(self.ctx.config.json.max_size_bytes);
        if text.len() > max {
            let err = JsonError::TooLarge { size: text.len(), max };
            self.report(&err).await;
            return Err(err);
        }
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                let err = JsonError::InvalidFormat(e.to_string());
                self.report(&err).await;
                return Err(err);
            }
        };
        self.validate(&value, opts).await?;
        Ok(value)
    }

    async fn report(&self, err: &JsonError) {
        debug!(error = %err, "value rejected");
        let entry = serde_json::json!({
            "error": err.error_code(),
            "details": err.to_string(),
            "timestamp": now_ms(),
        });
        oplog::append(&self.ctx, oplog::JSON_VALIDATION_LOG, &entry).await;
        self.ctx
            .events
            .emit(StorageEvent::new(EventKind::JsonValidationError).with_data("error", err.error_code()));
    }

    /// Persisted validation failures, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] if the log cannot be read.
    pub async fn validation_logs(&self) -> Result<Vec<Value>, BackendError> {
        oplog::entries(&self.ctx, oplog::JSON_VALIDATION_LOG).await
    }
}

#[cfg(test)]
#[path = "json_test.rs"]
mod tests;

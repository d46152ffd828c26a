//! Error taxonomy and the structured failure envelope.
//!
//! DESIGN
//! ======
//! Each concern owns a `thiserror` enum (`BackendError`, `KeyError`,
//! `JsonError`, `IntegrityError`). `StorageError` is what the CRUD services
//! return and wraps the others. Every error type implements [`ErrorCode`] so
//! callers get a grepable code and a retryable flag without matching on
//! variants.
//!
//! Public operations return `Result`. Callers that need the
//! `{success: false, error, timestamp}` shape (batch reports, CLI output)
//! convert with [`Failure::from_error`].

use serde::{Deserialize, Serialize};

use crate::backend::BackendError;
use crate::events::now_ms;
use crate::services::integrity::IntegrityError;
use crate::services::json::JsonError;
use crate::services::keys::KeyError;

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable error code and retryable flag for structured failures.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

// =============================================================================
// STORAGE ERROR
// =============================================================================

/// Errors returned by the save, read and delete services.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid key: {0}")]
    InvalidKey(#[from] KeyError),
    #[error("invalid data: {0}")]
    InvalidData(#[from] JsonError),
    #[error("storage quota exceeded: {size} bytes (max {max})")]
    StorageQuotaExceeded { size: usize, max: usize },
    #[error("compression failed: {0}")]
    CompressionFailed(String),
    #[error("integrity check failed for {key} (persisted: {persisted})")]
    IntegrityCheckFailed { key: String, persisted: bool },
    #[error("key not found: {0}")]
    KeyNotFound(String),
    #[error("parse error for {key}: {message}")]
    ParseError { key: String, message: String },
    #[error("read of {key} timed out after {timeout_ms}ms")]
    Timeout { key: String, timeout_ms: u64 },
    #[error("backup of {key} failed: {reason}")]
    BackupFailed { key: String, reason: String },
    #[error("validation failed: {0}")]
    ValidationFailed(String),
    #[error("integrity service error: {0}")]
    Integrity(#[from] IntegrityError),
    #[error("backend error: {0}")]
    Backend(BackendError),
}

impl From<BackendError> for StorageError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::QuotaExceeded { needed, available } => {
                Self::StorageQuotaExceeded { size: needed, max: available }
            }
            other => Self::Backend(other),
        }
    }
}

impl ErrorCode for StorageError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidKey(_) => "E_INVALID_KEY",
            Self::InvalidData(_) => "E_INVALID_DATA",
            Self::StorageQuotaExceeded { .. } => "E_STORAGE_QUOTA_EXCEEDED",
            Self::CompressionFailed(_) => "E_COMPRESSION_FAILED",
            Self::IntegrityCheckFailed { .. } => "E_INTEGRITY_CHECK_FAILED",
            Self::KeyNotFound(_) => "E_KEY_NOT_FOUND",
            Self::ParseError { .. } => "E_PARSE_ERROR",
            Self::Timeout { .. } => "E_TIMEOUT",
            Self::BackupFailed { .. } => "E_BACKUP_FAILED",
            Self::ValidationFailed(_) => "E_VALIDATION_FAILED",
            Self::Integrity(e) => e.error_code(),
            Self::Backend(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Integrity(e) => e.retryable(),
            Self::Backend(e) => e.retryable(),
            _ => false,
        }
    }
}

// =============================================================================
// FAILURE ENVELOPE
// =============================================================================

/// Structured failure returned across the public boundary instead of a raw error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub success: bool,
    pub code: String,
    pub error: String,
    pub retryable: bool,
    /// Milliseconds since Unix epoch.
    pub timestamp: i64,
}

impl Failure {
    /// Build the failure envelope from any typed error.
    #[must_use]
    pub fn from_error(err: &(impl ErrorCode + ?Sized)) -> Self {
        Self {
            success: false,
            code: err.error_code().to_owned(),
            error: err.to_string(),
            retryable: err.retryable(),
            timestamp: now_ms(),
        }
    }
}

#[cfg(test)]
#[path = "error_test.rs"]
mod tests;

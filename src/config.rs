//! Store configuration — constants, grouped settings, environment overrides.
//!
//! Every tunable has a `DEFAULT_*` constant and an optional `STORE_*`
//! environment override. Invalid override values fall back to the default
//! instead of failing startup.

use std::str::FromStr;

// =============================================================================
// DEFAULTS
// =============================================================================

pub const DEFAULT_KEY_MIN_LENGTH: usize = 3;
pub const DEFAULT_KEY_MAX_LENGTH: usize = 100;
pub const DEFAULT_NAMESPACE_SEPARATOR: char = ':';
pub const DEFAULT_MAX_NAMESPACE_DEPTH: usize = 3;
/// Characters allowed in keys besides ASCII alphanumerics.
pub const DEFAULT_KEY_EXTRA_CHARS: &str = "_-.";
pub const DEFAULT_RESERVED_PREFIXES: [&str; 5] = ["_system_", "_temp_", "_meta_", "_backup_", "_checksum_"];

pub const DEFAULT_JSON_MAX_SIZE_BYTES: usize = 1_000_000;
pub const DEFAULT_JSON_MAX_DEPTH: usize = 10;
pub const DEFAULT_JSON_MAX_ARRAY_LEN: usize = 10_000;
pub const DEFAULT_JSON_MAX_OBJECT_KEYS: usize = 1_000;

pub const DEFAULT_INTEGRITY_FRESHNESS_MS: i64 = 60 * 60 * 1000;
pub const DEFAULT_MAX_BACKUPS_PER_KEY: usize = 5;

pub const DEFAULT_MAX_VALUE_BYTES: usize = 5 * 1024 * 1024;
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024 * 1024;
pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_SAVE_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_SAVE_RETRY_DELAY_MS: u64 = 1000;

pub const DEFAULT_CACHE_TTL_MS: i64 = 5 * 60 * 1000;
pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 100;
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 3000;

pub const DEFAULT_DELETE_CHUNK_PAUSE_MS: u64 = 100;
pub const DEFAULT_SECURE_PASSES: usize = 3;
pub const DEFAULT_SECURE_PASS_DELAY_MS: u64 = 10;

pub const DEFAULT_AUTOSAVE_FLUSH_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_AUTOSAVE_DEBOUNCE_MS: i64 = 1000;
pub const DEFAULT_AUTOSAVE_MAX_QUEUE: usize = 100;
pub const DEFAULT_AUTOSAVE_SNAPSHOT_INTERVAL_MS: u64 = 5 * 60 * 1000;
pub const DEFAULT_AUTOSAVE_MAX_RETRIES: u32 = 3;
pub const DEFAULT_AUTOSAVE_RETRY_DELAY_MS: u64 = 2000;
pub const DEFAULT_AUTOSAVE_MAX_SNAPSHOTS: usize = 5;

pub const DEFAULT_LOADER_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_LOADER_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_LOADER_RETRY_DELAY_MS: u64 = 1000;

pub const DEFAULT_LOG_CAP: usize = 1000;

// =============================================================================
// GROUPS
// =============================================================================

/// Naming rules applied by the key validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRules {
    pub min_length: usize,
    pub max_length: usize,
    pub extra_chars: String,
    pub reserved_prefixes: Vec<String>,
    pub namespace_separator: char,
    pub max_namespace_depth: usize,
}

impl Default for KeyRules {
    fn default() -> Self {
        Self {
            min_length: DEFAULT_KEY_MIN_LENGTH,
            max_length: DEFAULT_KEY_MAX_LENGTH,
            extra_chars: DEFAULT_KEY_EXTRA_CHARS.to_owned(),
            reserved_prefixes: DEFAULT_RESERVED_PREFIXES.iter().map(|p| (*p).to_owned()).collect(),
            namespace_separator: DEFAULT_NAMESPACE_SEPARATOR,
            max_namespace_depth: DEFAULT_MAX_NAMESPACE_DEPTH,
        }
    }
}

/// Structural limits applied by the JSON validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JsonLimits {
    pub max_size_bytes: usize,
    pub max_depth: usize,
    pub max_array_len: usize,
    pub max_object_keys: usize,
}

impl Default for JsonLimits {
    fn default() -> Self {
        Self {
            max_size_bytes: DEFAULT_JSON_MAX_SIZE_BYTES,
            max_depth: DEFAULT_JSON_MAX_DEPTH,
            max_array_len: DEFAULT_JSON_MAX_ARRAY_LEN,
            max_object_keys: DEFAULT_JSON_MAX_OBJECT_KEYS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegrityConfig {
    /// Metadata older than this gets its `lastCheck` refreshed on verify.
    pub freshness_window_ms: i64,
    pub max_backups_per_key: usize,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            freshness_window_ms: DEFAULT_INTEGRITY_FRESHNESS_MS,
            max_backups_per_key: DEFAULT_MAX_BACKUPS_PER_KEY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveConfig {
    pub max_value_bytes: usize,
    pub compression_threshold: usize,
    pub batch_size: usize,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for SaveConfig {
    fn default() -> Self {
        Self {
            max_value_bytes: DEFAULT_MAX_VALUE_BYTES,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            batch_size: DEFAULT_BATCH_SIZE,
            retry_attempts: DEFAULT_SAVE_RETRY_ATTEMPTS,
            retry_delay_ms: DEFAULT_SAVE_RETRY_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadConfig {
    pub cache_ttl_ms: i64,
    pub cache_max_entries: usize,
    pub timeout_ms: u64,
    pub batch_size: usize,
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: DEFAULT_CACHE_TTL_MS,
            cache_max_entries: DEFAULT_CACHE_MAX_ENTRIES,
            timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteConfig {
    pub batch_size: usize,
    /// Pause between batch chunks.
    pub chunk_pause_ms: u64,
    pub secure_passes: usize,
    pub secure_pass_delay_ms: u64,
}

impl Default for DeleteConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            chunk_pause_ms: DEFAULT_DELETE_CHUNK_PAUSE_MS,
            secure_passes: DEFAULT_SECURE_PASSES,
            secure_pass_delay_ms: DEFAULT_SECURE_PASS_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoSaveConfig {
    pub flush_interval_ms: u64,
    pub debounce_ms: i64,
    pub max_queue_size: usize,
    pub snapshot_interval_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub max_snapshots: usize,
}

impl Default for AutoSaveConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: DEFAULT_AUTOSAVE_FLUSH_INTERVAL_MS,
            debounce_ms: DEFAULT_AUTOSAVE_DEBOUNCE_MS,
            max_queue_size: DEFAULT_AUTOSAVE_MAX_QUEUE,
            snapshot_interval_ms: DEFAULT_AUTOSAVE_SNAPSHOT_INTERVAL_MS,
            max_retries: DEFAULT_AUTOSAVE_MAX_RETRIES,
            retry_delay_ms: DEFAULT_AUTOSAVE_RETRY_DELAY_MS,
            max_snapshots: DEFAULT_AUTOSAVE_MAX_SNAPSHOTS,
        }
    }
}

/// Multi-key loads: one timeout around every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub timeout_ms: u64,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            timeout_ms: DEFAULT_LOADER_TIMEOUT_MS,
            max_attempts: DEFAULT_LOADER_MAX_ATTEMPTS,
            retry_delay_ms: DEFAULT_LOADER_RETRY_DELAY_MS,
        }
    }
}

// =============================================================================
// STORE CONFIG
// =============================================================================

/// Complete configuration shared by every service of one store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub keys: KeyRules,
    pub json: JsonLimits,
    pub integrity: IntegrityConfig,
    pub save: SaveConfig,
    pub read: ReadConfig,
    pub delete: DeleteConfig,
    pub autosave: AutoSaveConfig,
    pub loader: LoaderConfig,
    /// Maximum entries kept in each persisted diagnostic log.
    pub log_cap: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            keys: KeyRules::default(),
            json: JsonLimits::default(),
            integrity: IntegrityConfig::default(),
            save: SaveConfig::default(),
            read: ReadConfig::default(),
            delete: DeleteConfig::default(),
            autosave: AutoSaveConfig::default(),
            loader: LoaderConfig::default(),
            log_cap: DEFAULT_LOG_CAP,
        }
    }
}

impl StoreConfig {
    /// Defaults overridden by `STORE_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let keys = KeyRules {
            min_length: env_parse("STORE_KEY_MIN_LENGTH", DEFAULT_KEY_MIN_LENGTH),
            max_length: env_parse("STORE_KEY_MAX_LENGTH", DEFAULT_KEY_MAX_LENGTH),
            max_namespace_depth: env_parse("STORE_MAX_NAMESPACE_DEPTH", DEFAULT_MAX_NAMESPACE_DEPTH),
            ..KeyRules::default()
        };
        let json = JsonLimits {
            max_size_bytes: env_parse("STORE_JSON_MAX_SIZE_BYTES", DEFAULT_JSON_MAX_SIZE_BYTES),
            max_depth: env_parse("STORE_JSON_MAX_DEPTH", DEFAULT_JSON_MAX_DEPTH),
            max_array_len: env_parse("STORE_JSON_MAX_ARRAY_LEN", DEFAULT_JSON_MAX_ARRAY_LEN),
            max_object_keys: env_parse("STORE_JSON_MAX_OBJECT_KEYS", DEFAULT_JSON_MAX_OBJECT_KEYS),
        };
        let integrity = IntegrityConfig {
            freshness_window_ms: env_parse("STORE_INTEGRITY_FRESHNESS_MS", DEFAULT_INTEGRITY_FRESHNESS_MS),
            max_backups_per_key: env_parse("STORE_MAX_BACKUPS_PER_KEY", DEFAULT_MAX_BACKUPS_PER_KEY),
        };
        let save = SaveConfig {
            max_value_bytes: env_parse("STORE_MAX_VALUE_BYTES", DEFAULT_MAX_VALUE_BYTES),
            compression_threshold: env_parse("STORE_COMPRESSION_THRESHOLD", DEFAULT_COMPRESSION_THRESHOLD),
            batch_size: env_parse("STORE_BATCH_SIZE", DEFAULT_BATCH_SIZE),
            retry_attempts: env_parse("STORE_SAVE_RETRY_ATTEMPTS", DEFAULT_SAVE_RETRY_ATTEMPTS),
            retry_delay_ms: env_parse("STORE_SAVE_RETRY_DELAY_MS", DEFAULT_SAVE_RETRY_DELAY_MS),
        };
        let read = ReadConfig {
            cache_ttl_ms: env_parse("STORE_CACHE_TTL_MS", DEFAULT_CACHE_TTL_MS),
            cache_max_entries: env_parse("STORE_CACHE_MAX_ENTRIES", DEFAULT_CACHE_MAX_ENTRIES),
            timeout_ms: env_parse("STORE_READ_TIMEOUT_MS", DEFAULT_READ_TIMEOUT_MS),
            batch_size: save.batch_size,
        };
        let delete = DeleteConfig {
            batch_size: save.batch_size,
            chunk_pause_ms: env_parse("STORE_DELETE_CHUNK_PAUSE_MS", DEFAULT_DELETE_CHUNK_PAUSE_MS),
            secure_passes: env_parse("STORE_SECURE_PASSES", DEFAULT_SECURE_PASSES),
            secure_pass_delay_ms: env_parse("STORE_SECURE_PASS_DELAY_MS", DEFAULT_SECURE_PASS_DELAY_MS),
        };
        let autosave = AutoSaveConfig {
            flush_interval_ms: env_parse("STORE_AUTOSAVE_FLUSH_INTERVAL_MS", DEFAULT_AUTOSAVE_FLUSH_INTERVAL_MS),
            debounce_ms: env_parse("STORE_AUTOSAVE_DEBOUNCE_MS", DEFAULT_AUTOSAVE_DEBOUNCE_MS),
            max_queue_size: env_parse("STORE_AUTOSAVE_MAX_QUEUE", DEFAULT_AUTOSAVE_MAX_QUEUE),
            snapshot_interval_ms: env_parse(
                "STORE_AUTOSAVE_SNAPSHOT_INTERVAL_MS",
                DEFAULT_AUTOSAVE_SNAPSHOT_INTERVAL_MS,
            ),
            max_retries: env_parse("STORE_AUTOSAVE_MAX_RETRIES", DEFAULT_AUTOSAVE_MAX_RETRIES),
            retry_delay_ms: env_parse("STORE_AUTOSAVE_RETRY_DELAY_MS", DEFAULT_AUTOSAVE_RETRY_DELAY_MS),
            max_snapshots: env_parse("STORE_AUTOSAVE_MAX_SNAPSHOTS", DEFAULT_AUTOSAVE_MAX_SNAPSHOTS),
        };
        let loader = LoaderConfig {
            batch_size: save.batch_size,
            timeout_ms: env_parse("STORE_LOADER_TIMEOUT_MS", DEFAULT_LOADER_TIMEOUT_MS),
            max_attempts: env_parse("STORE_LOADER_MAX_ATTEMPTS", DEFAULT_LOADER_MAX_ATTEMPTS),
            retry_delay_ms: env_parse("STORE_LOADER_RETRY_DELAY_MS", DEFAULT_LOADER_RETRY_DELAY_MS),
        };

        Self {
            keys,
            json,
            integrity,
            save,
            read,
            delete,
            autosave,
            loader,
            log_cap: env_parse("STORE_LOG_CAP", DEFAULT_LOG_CAP),
        }
    }
}

/// Parse an environment variable, falling back to `default` when it is
/// unset or does not parse.
pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr + Copy,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;

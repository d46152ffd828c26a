use super::*;

// =============================================================================
// env_parse
// =============================================================================

#[test]
fn env_parse_missing_returns_default() {
    let val: usize = env_parse("__STORE_TEST_NONEXISTENT_KEY__", 42);
    assert_eq!(val, 42);
}

#[test]
fn env_parse_present_valid() {
    unsafe { std::env::set_var("__STORE_TEST_EP_VALID__", " 99 ") };
    let val: usize = env_parse("__STORE_TEST_EP_VALID__", 0);
    assert_eq!(val, 99);
    unsafe { std::env::remove_var("__STORE_TEST_EP_VALID__") };
}

#[test]
fn env_parse_present_invalid_returns_default() {
    unsafe { std::env::set_var("__STORE_TEST_EP_INVALID__", "notanumber") };
    let val: u64 = env_parse("__STORE_TEST_EP_INVALID__", 7);
    assert_eq!(val, 7);
    unsafe { std::env::remove_var("__STORE_TEST_EP_INVALID__") };
}

// =============================================================================
// defaults
// =============================================================================

#[test]
fn key_rules_defaults() {
    let rules = KeyRules::default();
    assert_eq!(rules.min_length, 3);
    assert_eq!(rules.max_length, 100);
    assert_eq!(rules.namespace_separator, ':');
    assert_eq!(rules.max_namespace_depth, 3);
    assert!(rules.reserved_prefixes.iter().any(|p| p == "_checksum_"));
    assert!(!rules.reserved_prefixes.iter().any(|p| p == "backup_"));
}

#[test]
fn store_config_defaults() {
    let config = StoreConfig::default();
    assert_eq!(config.save.max_value_bytes, 5 * 1024 * 1024);
    assert_eq!(config.save.compression_threshold, 1024 * 1024);
    assert_eq!(config.save.batch_size, 50);
    assert_eq!(config.save.retry_attempts, 3);
    assert_eq!(config.read.cache_ttl_ms, 300_000);
    assert_eq!(config.read.timeout_ms, 3000);
    assert_eq!(config.json.max_depth, 10);
    assert_eq!(config.autosave.debounce_ms, 1000);
    assert_eq!(config.autosave.max_queue_size, 100);
    assert_eq!(config.integrity.max_backups_per_key, 5);
    assert_eq!(config.loader, LoaderConfig { batch_size: 50, timeout_ms: 5000, max_attempts: 3, retry_delay_ms: 1000 });
    assert_eq!(config.log_cap, 1000);
}

#[test]
fn from_env_without_overrides_matches_defaults() {
    // Only the STORE_* variables are consulted; none are set in the test environment.
    let config = StoreConfig::from_env();
    assert_eq!(config.save, SaveConfig::default());
    assert_eq!(config.json, JsonLimits::default());
    assert_eq!(config.loader, LoaderConfig::default());
    assert_eq!(config.log_cap, DEFAULT_LOG_CAP);
}

use super::*;
use crate::backend::StorageBackend;
use crate::services::keys::KeyError;
use crate::services::save::{SaveOptions, SaveService};
use crate::test_helpers::{faulty_context, memory_context};
use serde_json::json;

fn services(ctx: &StoreContext) -> (SaveService, ReadService) {
    let cache = ReadCache::new(60_000, 100);
    (SaveService::new(ctx.clone(), cache.clone()), ReadService::new(ctx.clone(), cache))
}

// =============================================================================
// cache
// =============================================================================

#[test]
fn cache_expires_entries() {
    let cache = ReadCache::new(0, 10);
    cache.put("k", json!(1));
    assert!(cache.get("k").is_none());
    assert_eq!(cache.stats(), CacheStats { entries: 0, hits: 0, misses: 1 });
}

#[test]
fn cache_evicts_oldest_when_full() {
    let cache = ReadCache::new(60_000, 2);
    cache.put("a", json!(1));
    std::thread::sleep(Duration::from_millis(2));
    cache.put("b", json!(2));
    std::thread::sleep(Duration::from_millis(2));
    cache.put("c", json!(3));

    assert!(cache.get("a").is_none());
    assert_eq!(cache.get("b").map(|(v, _)| v), Some(json!(2)));
    assert_eq!(cache.get("c").map(|(v, _)| v), Some(json!(3)));
    assert_eq!(cache.stats().entries, 2);
}

#[test]
fn cache_invalidate_and_clear() {
    let cache = ReadCache::new(60_000, 10);
    cache.put("a", json!(1));
    cache.put("b", json!(2));
    cache.invalidate("a");
    assert!(cache.get("a").is_none());
    cache.clear();
    assert_eq!(cache.stats().entries, 0);
}

// =============================================================================
// read_item
// =============================================================================

#[tokio::test]
async fn save_then_read_round_trips() {
    let (ctx, _backend) = memory_context();
    let (saver, reader) = services(&ctx);
    let data = json!({"id": "user_42", "tags": ["a", "b"], "nested": {"n": 1.5}});

    saver.save_item("user_42", &data, &SaveOptions::default()).await.unwrap();

    let first = reader.read_item("user_42", &ReadOptions::default()).await.unwrap();
    assert_eq!(first.data, data);
    assert_eq!(first.source, ReadSource::Storage);

    let second = reader.read_item("user_42", &ReadOptions::default()).await.unwrap();
    assert_eq!(second.data, data);
    assert_eq!(second.source, ReadSource::Cache);

    let stats = reader.cache().stats();
    assert_eq!(stats.hits, 1);
}

#[tokio::test]
async fn compressed_values_read_back() {
    let mut config = crate::test_helpers::fast_config();
    config.save.compression_threshold = 64;
    let (ctx, _backend) = crate::test_helpers::context_with_config(config);
    let (saver, reader) = services(&ctx);
    let data = json!({"body": "lorem ipsum ".repeat(40)});

    assert!(saver.save_item("doc", &data, &SaveOptions::default()).await.unwrap().compressed);
    let opts = ReadOptions { use_cache: false, ..ReadOptions::default() };
    assert_eq!(reader.read_item("doc", &opts).await.unwrap().data, data);
}

#[tokio::test]
async fn missing_key_is_not_found() {
    let (ctx, _backend) = memory_context();
    let (_, reader) = services(&ctx);

    let err = reader.read_item("nope", &ReadOptions::default()).await.unwrap_err();
    assert!(matches!(err, StorageError::KeyNotFound(ref k) if k == "nope"));

    let logs = reader.read_logs().await.unwrap();
    assert!(!logs[0].success);
}

#[tokio::test]
async fn unparseable_payload_is_parse_error() {
    let (ctx, backend) = memory_context();
    let (_, reader) = services(&ctx);
    backend.set("doc", "{truncated").await.unwrap();

    let err = reader.read_item("doc", &ReadOptions::default()).await.unwrap_err();
    assert!(matches!(err, StorageError::ParseError { .. }));

    backend.set("doc", "gz1:@@@").await.unwrap();
    let err = reader.read_item("doc", &ReadOptions::default()).await.unwrap_err();
    assert!(matches!(err, StorageError::ParseError { .. }));
}

#[tokio::test]
async fn unrecorded_value_is_accepted_as_first_write() {
    let (ctx, backend) = memory_context();
    let (_, reader) = services(&ctx);
    backend.set("legacy", r#"{"a":1}"#).await.unwrap();

    let result = reader.read_item("legacy", &ReadOptions::default()).await.unwrap();
    assert_eq!(result.data, json!({"a": 1}));
    assert!(backend.get("_checksum_legacy").await.unwrap().is_some());
}

#[tokio::test]
async fn tampered_value_fails_then_reads_restored_backup() {
    let (ctx, backend) = memory_context();
    let (saver, reader) = services(&ctx);
    let opts = ReadOptions { use_cache: false, ..ReadOptions::default() };

    saver.save_item("user_42", &json!({"v": 1}), &SaveOptions::default()).await.unwrap();
    saver.save_item("user_42", &json!({"v": 2}), &SaveOptions::default()).await.unwrap();
    backend.set("user_42", r#"{"v":666}"#).await.unwrap();

    let err = reader.read_item("user_42", &opts).await.unwrap_err();
    assert!(matches!(err, StorageError::IntegrityCheckFailed { persisted: false, .. }));
    assert_eq!(backend.keys_with_prefix("corrupted_user_42_").await.unwrap().len(), 1);

    // The newest backup holds the value that preceded the last save.
    let restored = reader.read_item("user_42", &opts).await.unwrap();
    assert_eq!(restored.data, json!({"v": 1}));
}

#[tokio::test]
async fn log_named_key_is_rejected_before_locking() {
    let (ctx, backend) = memory_context();
    let (saver, reader) = services(&ctx);
    backend.set(oplog::CORRUPTION_LOG, "[1]").await.unwrap();

    let err = saver.save_item(oplog::CORRUPTION_LOG, &json!([]), &SaveOptions::default()).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidKey(KeyError::ReservedName(_))));

    let opts = ReadOptions { use_cache: false, ..ReadOptions::default() };
    let read = tokio::time::timeout(Duration::from_secs(2), reader.read_item(oplog::CORRUPTION_LOG, &opts)).await;
    assert!(matches!(read, Ok(Err(StorageError::InvalidKey(_)))));
}

#[tokio::test]
async fn integrity_check_can_be_skipped() {
    let (ctx, backend) = memory_context();
    let (saver, reader) = services(&ctx);
    saver.save_item("doc", &json!(1), &SaveOptions::default()).await.unwrap();
    backend.set("doc", "2").await.unwrap();

    let opts = ReadOptions { use_cache: false, verify_integrity: false, timeout_ms: None };
    assert_eq!(reader.read_item("doc", &opts).await.unwrap().data, json!(2));
}

#[tokio::test]
async fn slow_backend_times_out() {
    let (ctx, backend) = faulty_context();
    let (_, reader) = services(&ctx);
    backend.inner().set("doc", "1").await.unwrap();
    backend.slow_gets(Duration::from_millis(200));

    let opts = ReadOptions { timeout_ms: Some(20), ..ReadOptions::default() };
    let err = reader.read_item("doc", &opts).await.unwrap_err();
    assert!(matches!(err, StorageError::Timeout { timeout_ms: 20, .. }));
    assert!(err.to_string().contains("timed out"));
}

#[tokio::test]
async fn batch_read_reports_missing_keys() {
    let (ctx, _backend) = memory_context();
    let (saver, reader) = services(&ctx);
    for i in 0..3 {
        saver.save_item(&format!("k{i}"), &json!(i), &SaveOptions::default()).await.unwrap();
    }

    let keys = vec!["k0".into(), "k1".into(), "k2".into(), "missing".into()];
    let report = reader.batch_read(keys, &ReadOptions::default()).await;
    assert_eq!(report.success.len(), 3);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].failure.code, "E_KEY_NOT_FOUND");
}

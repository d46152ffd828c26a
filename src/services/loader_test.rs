use super::*;
use crate::backend::StorageBackend;
use crate::services::save::{SaveOptions, SaveService};
use crate::test_helpers::{faulty_context, memory_context};
use serde_json::json;

fn services(ctx: &StoreContext) -> (SaveService, DataLoader) {
    let cache = ReadCache::new(60_000, 100);
    (SaveService::new(ctx.clone(), cache.clone()), DataLoader::new(ctx.clone(), cache))
}

fn keys(names: &[&str]) -> Vec<String> {
    names.iter().map(|k| (*k).to_owned()).collect()
}

#[tokio::test]
async fn loads_present_keys_and_serves_repeats_from_cache() {
    let (ctx, _backend) = memory_context();
    let (saver, loader) = services(&ctx);
    saver.save_item("a1", &json!({"n": 1}), &SaveOptions::default()).await.unwrap();
    saver.save_item("a2", &json!([2]), &SaveOptions::default()).await.unwrap();

    let loaded = loader.load(&keys(&["a1", "a2", "missing"]), &LoadOptions::default()).await.unwrap();
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded["a1"], json!({"n": 1}));
    assert_eq!(loaded["a2"], json!([2]));

    let again = loader.load(&keys(&["a1", "a2"]), &LoadOptions::default()).await.unwrap();
    assert_eq!(again, loaded);
    assert_eq!(loader.stats(), LoaderStats { hits: 1, misses: 1, errors: 0 });
}

#[tokio::test]
async fn transient_read_failures_are_retried() {
    let (ctx, backend) = faulty_context();
    let (saver, loader) = services(&ctx);
    saver.save_item("a1", &json!(1), &SaveOptions::default()).await.unwrap();
    saver.save_item("a2", &json!(2), &SaveOptions::default()).await.unwrap();
    backend.fail_gets_of("a1", 2);

    let opts = LoadOptions { use_cache: false, ..LoadOptions::default() };
    let loaded = loader.load(&keys(&["a1", "a2"]), &opts).await.unwrap();
    assert_eq!(loaded.len(), 2);
    assert_eq!(loader.stats().errors, 0);
    assert!(loader.error_logs().await.unwrap().is_empty());
}

#[tokio::test]
async fn exhausted_retries_fail_the_load() {
    let (ctx, backend) = faulty_context();
    let mut sub = ctx.events.subscribe();
    let (saver, loader) = services(&ctx);
    saver.save_item("a1", &json!(1), &SaveOptions::default()).await.unwrap();
    backend.fail_gets_of("a1", 10);

    let opts = LoadOptions { use_cache: false, ..LoadOptions::default() };
    let err = loader.load(&keys(&["a1", "a2"]), &opts).await.unwrap_err();
    assert_eq!(err.error_code(), "E_BACKEND_UNAVAILABLE");
    assert!(err.retryable());
    assert_eq!(loader.stats().errors, 1);

    let logs = loader.error_logs().await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].keys, keys(&["a1", "a2"]));

    let announced = std::iter::from_fn(|| sub.rx.try_recv().ok()).any(|e| e.kind == EventKind::DataLoaderError);
    assert!(announced);
}

#[tokio::test]
async fn structurally_invalid_value_is_left_out() {
    let (ctx, backend) = memory_context();
    let (saver, loader) = services(&ctx);
    let deep = format!("{}1{}", "[".repeat(12), "]".repeat(12));
    backend.set("deep", &deep).await.unwrap();
    saver.save_item("flat", &json!("ok"), &SaveOptions::default()).await.unwrap();

    let loaded = loader.load(&keys(&["deep", "flat"]), &LoadOptions::default()).await.unwrap();
    assert_eq!(loaded.keys().collect::<Vec<_>>(), vec!["flat"]);

    let logs = loader.error_logs().await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].keys, keys(&["deep"]));
    assert_eq!(logs[0].code, "E_VALIDATION_FAILED");

    let unchecked = LoadOptions { validate: false, ..LoadOptions::default() };
    let loaded = loader.load(&keys(&["deep", "flat"]), &unchecked).await.unwrap();
    assert_eq!(loaded.len(), 2);
}

#[tokio::test]
async fn deadline_covers_the_whole_load() {
    let (ctx, backend) = faulty_context();
    let (_, loader) = services(&ctx);
    backend.inner().set("slow", "1").await.unwrap();
    backend.slow_gets(Duration::from_millis(200));

    let opts = LoadOptions { use_cache: false, validate: false, timeout_ms: Some(20) };
    let err = loader.load(&keys(&["slow"]), &opts).await.unwrap_err();
    assert!(matches!(err, StorageError::Timeout { timeout_ms: 20, .. }));
    assert_eq!(loader.stats(), LoaderStats { hits: 0, misses: 1, errors: 1 });
}

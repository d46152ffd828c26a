use super::*;
use crate::backend::StorageBackend;
use crate::test_helpers::{context_with_config, memory_context};

#[tokio::test]
async fn append_then_read_back() {
    let (ctx, _backend) = memory_context();
    append(&ctx, SAVE_LOG, &OperationLogEntry::succeeded("user_42")).await;
    append(&ctx, SAVE_LOG, &OperationLogEntry::failed("user_43", "boom")).await;

    let log: Vec<OperationLogEntry> = typed_entries(&ctx, SAVE_LOG).await.unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].key, "user_42");
    assert!(log[0].success);
    assert_eq!(log[1].error.as_deref(), Some("boom"));
}

#[tokio::test]
async fn cap_evicts_oldest_first() {
    let mut config = crate::config::StoreConfig::default();
    config.log_cap = 3;
    let (ctx, _backend) = context_with_config(config);

    for i in 0..5 {
        append(&ctx, READ_LOG, &OperationLogEntry::succeeded(&format!("key_{i}"))).await;
    }

    let log: Vec<OperationLogEntry> = typed_entries(&ctx, READ_LOG).await.unwrap();
    let keys: Vec<_> = log.iter().map(|e| e.key.as_str()).collect();
    assert_eq!(keys, vec!["key_2", "key_3", "key_4"]);
}

#[tokio::test]
async fn undecodable_log_is_replaced() {
    let (ctx, backend) = memory_context();
    backend.set(DELETE_LOG, "not json").await.unwrap();

    append(&ctx, DELETE_LOG, &OperationLogEntry::succeeded("k1")).await;

    assert_eq!(entries(&ctx, DELETE_LOG).await.unwrap().len(), 1);
}

#[tokio::test]
async fn concurrent_appends_are_not_lost() {
    let (ctx, _backend) = memory_context();
    let tasks: Vec<_> = (0..20)
        .map(|i| {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                append(&ctx, SAVE_LOG, &OperationLogEntry::succeeded(&format!("k{i}"))).await;
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(entries(&ctx, SAVE_LOG).await.unwrap().len(), 20);
}

#[tokio::test]
async fn append_does_not_wait_on_entry_lock_of_same_name() {
    let (ctx, _backend) = memory_context();
    let _entry = ctx.locks.acquire(CORRUPTION_LOG).await;

    let appended = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        append(&ctx, CORRUPTION_LOG, &OperationLogEntry::succeeded("k1")),
    )
    .await;
    assert!(appended.is_ok());
    assert_eq!(entries(&ctx, CORRUPTION_LOG).await.unwrap().len(), 1);
}

#[test]
fn log_names_match_ignoring_case() {
    assert!(is_log_key("corruption_logs"));
    assert!(is_log_key("DATA_LOADER_LOGS"));
    assert!(!is_log_key("corruption_logs_v2"));
}

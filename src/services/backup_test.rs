use super::*;
use crate::backend::StorageBackend;
use crate::config::StoreConfig;
use crate::test_helpers::{context_with_config, memory_context};

#[tokio::test]
async fn create_writes_envelope() {
    let (ctx, backend) = memory_context();
    let backups = Backups::new(ctx);

    let key = backups.create("user_42", r#"{"n":1}"#, BackupKind::PreSave).await.unwrap();
    assert!(key.starts_with("backup_user_42_"));

    let raw = backend.get(&key).await.unwrap().unwrap();
    let record: BackupRecord = serde_json::from_str(&raw).unwrap();
    assert_eq!(record.original_key, "user_42");
    assert_eq!(record.value, r#"{"n":1}"#);
    assert_eq!(record.backup_type, BackupKind::PreSave);
    assert_eq!(record.original_size, 7);
    assert_eq!(key, backup_key("user_42", record.timestamp));
}

#[tokio::test]
async fn colliding_timestamps_never_overwrite() {
    let (ctx, _backend) = memory_context();
    let backups = Backups::new(ctx);

    let mut keys = Vec::new();
    for i in 0..4 {
        keys.push(backups.create("k1", &i.to_string(), BackupKind::PreSave).await.unwrap());
    }
    keys.dedup();
    assert_eq!(keys.len(), 4);
    assert_eq!(backups.list("k1").await.unwrap().len(), 4);
}

#[tokio::test]
async fn list_ignores_backups_of_longer_keys() {
    let (ctx, backend) = memory_context();
    backend.set("backup_a_100", "x").await.unwrap();
    backend.set("backup_a_1_200", "y").await.unwrap();
    backend.set("backup_a_", "z").await.unwrap();
    let backups = Backups::new(ctx);

    assert_eq!(backups.list("a").await.unwrap(), vec![(100, "backup_a_100".to_owned())]);
    assert_eq!(backups.list("a_1").await.unwrap(), vec![(200, "backup_a_1_200".to_owned())]);
}

#[tokio::test]
async fn latest_prefers_newest_and_accepts_legacy_payloads() {
    let (ctx, backend) = memory_context();
    backend.set("backup_doc_100", r#"{"v":"old"}"#).await.unwrap();
    backend.set("backup_doc_300", r#"{"v":"new"}"#).await.unwrap();
    let backups = Backups::new(ctx);

    let (key, record) = backups.latest("doc").await.unwrap().unwrap();
    assert_eq!(key, "backup_doc_300");
    assert_eq!(record.backup_type, BackupKind::Legacy);
    assert_eq!(record.value, r#"{"v":"new"}"#);
    assert_eq!(record.timestamp, 300);

    assert!(backups.latest("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn retention_keeps_newest() {
    let mut config = StoreConfig::default();
    config.integrity.max_backups_per_key = 2;
    let (ctx, _backend) = context_with_config(config);
    let backups = Backups::new(ctx);

    for i in 0..5 {
        backups.create("k1", &i.to_string(), BackupKind::PreDelete).await.unwrap();
    }

    let remaining = backups.list("k1").await.unwrap();
    assert_eq!(remaining.len(), 2);
    let (_, newest) = backups.latest("k1").await.unwrap().unwrap();
    assert_eq!(newest.value, "4");
}

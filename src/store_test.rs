use super::*;
use crate::error::ErrorCode;
use crate::events::EventKind;
use crate::services::autosave::InputChange;
use crate::services::backup::BackupRecord;
use crate::test_helpers::fast_config;
use serde_json::json;

fn storage() -> (Storage, MemoryBackend) {
    let backend = MemoryBackend::new();
    (Storage::new(Arc::new(backend.clone()), fast_config()), backend)
}

#[tokio::test]
async fn user_42_lifecycle() {
    let (store, backend) = storage();
    let mut sub = store.subscribe();
    let profile = json!({"id": "user_42", "name": "Ada", "roles": ["admin"]});

    store.save_item("user_42", &profile).await.unwrap();
    assert_eq!(store.read_item("user_42").await.unwrap(), profile);

    let updated = json!({"id": "user_42", "name": "Ada L.", "roles": ["admin"]});
    store.save_item("user_42", &updated).await.unwrap();
    assert_eq!(store.read_item("user_42").await.unwrap(), updated);

    let backups = backend.keys_with_prefix("backup_user_42_").await.unwrap();
    assert_eq!(backups.len(), 1);
    let suffix = &backups[0]["backup_user_42_".len()..];
    assert!(suffix.parse::<i64>().is_ok());
    let record: BackupRecord = serde_json::from_str(&backend.get(&backups[0]).await.unwrap().unwrap()).unwrap();
    assert_eq!(serde_json::from_str::<Value>(&record.value).unwrap(), profile);

    store.delete_item("user_42").await.unwrap();
    let err = store.read_item("user_42").await.unwrap_err();
    assert_eq!(err.error_code(), "E_KEY_NOT_FOUND");
    let err = store.delete_item("user_42").await.unwrap_err();
    assert_eq!(err.error_code(), "E_KEY_NOT_FOUND");

    let actions: Vec<String> = std::iter::from_fn(|| sub.rx.try_recv().ok())
        .filter(|e| e.kind == EventKind::StorageChange)
        .filter_map(|e| e.str_field("action").map(String::from))
        .collect();
    assert_eq!(actions, vec!["save", "save", "delete"]);
}

#[tokio::test]
async fn tamper_is_detected_and_recovered() {
    let (store, backend) = storage();
    store.save_item("user_42", &json!({"v": 1})).await.unwrap();
    store.save_item("user_42", &json!({"v": 2})).await.unwrap();
    store.read_item("user_42").await.unwrap();

    backend.set("user_42", r#"{"v":999}"#).await.unwrap();
    let outcome = store.verify("user_42").await.unwrap();
    let Verification::Corrupted { quarantine_key, restored_from } = outcome else {
        panic!("expected corruption, got {outcome:?}");
    };
    assert!(quarantine_key.starts_with("corrupted_user_42_"));
    assert!(restored_from.is_some());

    // The cached value was dropped, so the restored value is served.
    assert_eq!(store.read_item("user_42").await.unwrap(), json!({"v": 1}));
    let logs = store.integrity().corruption_logs().await.unwrap();
    assert!(!logs.is_empty());
}

#[tokio::test]
async fn verify_missing_key_is_not_found() {
    let (store, _backend) = storage();
    let err = store.verify("absent").await.unwrap_err();
    assert!(matches!(err, StorageError::KeyNotFound(_)));
}

#[tokio::test]
async fn batch_operations_share_one_cache() {
    let (store, _backend) = storage();
    let items = (0..5).map(|i| SaveItem { key: format!("row_{i}"), data: json!({"i": i}) }).collect();
    assert_eq!(store.batch_save(items).await.success.len(), 5);

    let keys: Vec<String> = (0..5).map(|i| format!("row_{i}")).collect();
    assert_eq!(store.batch_read(keys.clone()).await.success.len(), 5);
    assert_eq!(store.cache().stats().entries, 5);

    let report = store.batch_delete(keys).await;
    assert_eq!(report.success.len(), 5);
    assert_eq!(store.cache().stats().entries, 0);
}

#[tokio::test]
async fn load_shares_the_read_cache() {
    let (store, _backend) = storage();
    store.save_item("cfg_a", &json!(1)).await.unwrap();
    store.save_item("cfg_b", &json!(2)).await.unwrap();
    store.read_item("cfg_a").await.unwrap();

    let keys = vec!["cfg_a".to_owned(), "cfg_b".to_owned()];
    let loaded = store.load(&keys).await.unwrap();
    assert_eq!(loaded["cfg_b"], json!(2));
    assert_eq!(store.cache().stats().entries, 2);

    store.delete_item("cfg_b").await.unwrap();
    let loaded = store.load(&keys).await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(store.loader().stats().misses, 2);
}

#[tokio::test]
async fn autosave_flows_through_save_service() {
    let (store, backend) = storage();
    for text in ["H", "He", "Hello"] {
        store.autosave().observe(InputChange::new("editor", json!(text))).await;
    }
    let summary = store.shutdown().await;
    assert_eq!(summary.saved, vec!["editor".to_owned()]);
    assert_eq!(backend.get("editor").await.unwrap().as_deref(), Some(r#""Hello""#));
    assert!(backend.get("_checksum_editor").await.unwrap().is_some());
}

#[tokio::test]
async fn workers_start_and_abort() {
    let mut config = fast_config();
    config.autosave.flush_interval_ms = 10;
    let backend = MemoryBackend::new();
    let store = Storage::new(Arc::new(backend.clone()), config);
    let workers = store.start();

    store.autosave().observe(InputChange::new("draft", json!(1))).await;
    let mut saved = false;
    for _ in 0..100 {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        if backend.get("draft").await.unwrap().is_some() {
            saved = true;
            break;
        }
    }
    assert!(saved);
    let mut relayed = false;
    for _ in 0..100 {
        if store.bridge().stats().events.contains_key("auto_save_update") {
            relayed = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    workers.abort();
    assert!(relayed);
}

#[tokio::test]
async fn file_store_persists_across_reopen() {
    let path = std::env::temp_dir().join(format!("storekeeper-{}.json", uuid::Uuid::new_v4()));
    {
        let store = Storage::open_file(&path, fast_config()).await.unwrap();
        store.save_item("settings", &json!({"theme": "dark"})).await.unwrap();
    }
    let reopened = Storage::open_file(&path, fast_config()).await.unwrap();
    assert_eq!(reopened.read_item("settings").await.unwrap(), json!({"theme": "dark"}));
    std::fs::remove_file(&path).unwrap();
}

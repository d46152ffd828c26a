use super::*;
use std::time::Duration;

#[tokio::test]
async fn same_key_is_exclusive() {
    let locks = KeyLocks::new();
    let guard = locks.acquire("user_42").await;

    let contender = {
        let locks = locks.clone();
        tokio::spawn(async move {
            let _held = locks.acquire("user_42").await;
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!contender.is_finished());

    drop(guard);
    tokio::time::timeout(Duration::from_secs(1), contender).await.unwrap().unwrap();
}

#[tokio::test]
async fn different_keys_do_not_block() {
    let locks = KeyLocks::new();
    let _a = locks.acquire("alpha").await;
    let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire("beta")).await;
    assert!(b.is_ok());
}

#[tokio::test]
async fn idle_entries_are_pruned() {
    let locks = KeyLocks::new();
    drop(locks.acquire("one").await);
    drop(locks.acquire("two").await);
    let _three = locks.acquire("three").await;
    // "one" and "two" were idle when "three" was acquired.
    assert_eq!(locks.tracked(), 1);
}

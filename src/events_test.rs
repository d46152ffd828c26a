use super::*;

#[test]
fn change_event_sets_action_and_key() {
    let event = StorageEvent::change("save", "user_42").with_data("size", 17);
    assert_eq!(event.kind, EventKind::StorageChange);
    assert_eq!(event.key.as_deref(), Some("user_42"));
    assert_eq!(event.str_field("action"), Some("save"));
    assert_eq!(event.data.get("size"), Some(&serde_json::json!(17)));
    assert!(event.ts > 0);
}

#[test]
fn kind_serializes_to_event_name() {
    let json = serde_json::to_value(EventKind::DataCorruption).unwrap();
    assert_eq!(json, serde_json::json!("data_corruption"));
    assert_eq!(EventKind::AutoSaveUpdate.as_str(), "auto_save_update");
}

#[tokio::test]
async fn emit_reaches_every_subscriber() {
    let bus = EventBus::new();
    let mut a = bus.subscribe();
    let mut b = bus.subscribe();

    bus.emit(StorageEvent::change("delete", "k1"));

    assert_eq!(a.rx.try_recv().unwrap().key.as_deref(), Some("k1"));
    assert_eq!(b.rx.try_recv().unwrap().key.as_deref(), Some("k1"));
}

#[tokio::test]
async fn closed_subscriber_is_dropped_on_emit() {
    let bus = EventBus::new();
    let sub = bus.subscribe();
    assert_eq!(bus.subscriber_count(), 1);

    drop(sub);
    bus.emit(StorageEvent::new(EventKind::Connectivity));

    assert_eq!(bus.subscriber_count(), 0);
}

#[tokio::test]
async fn full_subscriber_keeps_subscription_and_misses_event() {
    let bus = EventBus::new();
    let mut sub = bus.subscribe_with_capacity(1);

    bus.emit(StorageEvent::change("save", "first"));
    // Channel is full (capacity 1); the second event is dropped, not an error.
    bus.emit(StorageEvent::change("save", "second"));

    assert_eq!(bus.subscriber_count(), 1);
    assert_eq!(sub.rx.try_recv().unwrap().key.as_deref(), Some("first"));
    assert!(sub.rx.try_recv().is_err());
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let bus = EventBus::new();
    let mut sub = bus.subscribe();
    bus.unsubscribe(sub.id);

    bus.emit(StorageEvent::change("save", "k"));
    assert!(sub.rx.try_recv().is_err());
}

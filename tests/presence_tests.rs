// Presence manager tests
// Lifecycle-driven online/offline writes and read-only observation of other users

mod common;
use common::{anonymous_session, epoch, latest, recorder, session_for, setup_store};

use chrono::Duration as ChronoDuration;
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

use chatterbox_sync::store::paths;
use chatterbox_sync::sync::{LifecycleEvent, PresenceManager};
use chatterbox_sync::{PresenceStatus, PresenceView, RemoteStore};

#[tokio::test(start_paused = true)]
async fn test_go_offline_stamps_last_seen() {
    let (store, clock) = setup_store();
    let presence = PresenceManager::new(session_for(&store, &clock, "alice", "Alice"));

    sleep(Duration::from_secs(2)).await;
    presence.go_offline("alice").await.unwrap();

    let doc = store.get(paths::PRESENCE, "alice").await.unwrap().unwrap();
    let stamped = epoch() + ChronoDuration::seconds(2);
    assert_eq!(doc.get("status"), Some(&json!("offline")));
    assert_eq!(doc.get("lastSeen"), Some(&json!(stamped.timestamp_millis())));

    match presence.fetch("alice").await.unwrap() {
        PresenceView::Known(record) => {
            assert_eq!(record.status, PresenceStatus::Offline);
            assert_eq!(record.last_seen, Some(stamped));
        }
        PresenceView::Unknown => panic!("presence record should exist"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_go_online_keeps_last_seen() {
    let (store, clock) = setup_store();
    let presence = PresenceManager::new(session_for(&store, &clock, "alice", "Alice"));

    presence.go_offline("alice").await.unwrap();
    let before = store.get(paths::PRESENCE, "alice").await.unwrap().unwrap();

    sleep(Duration::from_secs(30)).await;
    presence.go_online("alice").await.unwrap();
    let after = store.get(paths::PRESENCE, "alice").await.unwrap().unwrap();

    assert_eq!(after.get("status"), Some(&json!("online")));
    assert_eq!(after.get("lastSeen"), before.get("lastSeen"));
}

/// A user with no record is unknown, not offline
#[tokio::test]
async fn test_observe_missing_record_is_unknown() {
    let (store, clock) = setup_store();
    let observer = PresenceManager::new(session_for(&store, &clock, "bob", "Bob"));
    let carol = PresenceManager::new(session_for(&store, &clock, "carol", "Carol"));

    let (seen, sink) = recorder::<PresenceView>();
    let _watch = observer.observe("carol", sink);
    sleep(Duration::from_millis(20)).await;
    assert_eq!(latest(&seen), Some(PresenceView::Unknown));
    assert_eq!(observer.fetch("carol").await.unwrap(), PresenceView::Unknown);

    carol.go_online("carol").await.unwrap();
    sleep(Duration::from_millis(20)).await;
    match latest(&seen) {
        Some(PresenceView::Known(record)) => {
            assert_eq!(record.uid, "carol");
            assert_eq!(record.status, PresenceStatus::Online);
        }
        other => panic!("expected carol's record, got {:?}", other),
    }

    // Another user's record never shows up in this feed
    observer.go_online("bob").await.unwrap();
    sleep(Duration::from_millis(20)).await;
    assert!(matches!(latest(&seen), Some(PresenceView::Known(r)) if r.uid == "carol"));
}

#[tokio::test]
async fn test_lifecycle_transitions() {
    assert_eq!(LifecycleEvent::Foreground.presence(), PresenceStatus::Online);
    assert_eq!(LifecycleEvent::Background.presence(), PresenceStatus::Offline);
    assert_eq!(LifecycleEvent::Inactive.presence(), PresenceStatus::Offline);

    let (store, clock) = setup_store();
    let presence = PresenceManager::new(session_for(&store, &clock, "alice", "Alice"));

    presence.on_lifecycle(LifecycleEvent::Foreground).await.unwrap();
    let doc = store.get(paths::PRESENCE, "alice").await.unwrap().unwrap();
    assert_eq!(doc.get("status"), Some(&json!("online")));

    presence.on_lifecycle(LifecycleEvent::Inactive).await.unwrap();
    let doc = store.get(paths::PRESENCE, "alice").await.unwrap().unwrap();
    assert_eq!(doc.get("status"), Some(&json!("offline")));
    assert!(doc.get("lastSeen").is_some());
}

#[tokio::test]
async fn test_run_lifecycle_applies_events_in_order() {
    let (store, clock) = setup_store();
    let presence = PresenceManager::new(session_for(&store, &clock, "alice", "Alice"));

    let (tx, rx) = mpsc::channel(8);
    let runner = tokio::spawn(presence.clone().run_lifecycle(rx));

    // A failed write is skipped, later transitions still apply
    store.set_offline(true);
    tx.send(LifecycleEvent::Foreground).await.unwrap();
    sleep(Duration::from_millis(20)).await;
    store.set_offline(false);

    tx.send(LifecycleEvent::Foreground).await.unwrap();
    tx.send(LifecycleEvent::Background).await.unwrap();
    drop(tx);
    runner.await.unwrap();

    let writes = store.writes_to(paths::PRESENCE);
    assert_eq!(writes.len(), 2);
    let doc = store.get(paths::PRESENCE, "alice").await.unwrap().unwrap();
    assert_eq!(doc.get("status"), Some(&json!("offline")));
}

#[tokio::test]
async fn test_lifecycle_before_sign_in_is_ignored() {
    let (store, clock) = setup_store();
    let presence = PresenceManager::new(anonymous_session(&store, &clock));

    presence.on_lifecycle(LifecycleEvent::Foreground).await.unwrap();
    presence.on_lifecycle(LifecycleEvent::Background).await.unwrap();
    assert!(store.writes().is_empty());
}

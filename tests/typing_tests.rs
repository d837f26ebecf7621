// Typing coordinator tests
// Debounced intent writes and TTL-filtered peer views. Time is paused so the
// debounce windows and record expiry can be stepped through exactly.

mod common;
use common::{anonymous_session, latest, recorder, session_for, setup_store};

use serde_json::json;
use std::time::Duration;
use tokio::time::sleep;

use chatterbox_sync::store::{paths, WriteOp};
use chatterbox_sync::sync::TypingCoordinator;
use chatterbox_sync::{LocalUser, RemoteStore, StoreError, TypingPeer};

#[tokio::test(start_paused = true)]
async fn test_repeated_start_writes_once() {
    let (store, clock) = setup_store();
    let typing = TypingCoordinator::new(session_for(&store, &clock, "alice", "Alice"));

    typing.set_typing("c1", true).await;
    typing.set_typing("c1", true).await;
    sleep(Duration::from_millis(200)).await;
    typing.set_typing("c1", true).await;
    sleep(Duration::from_secs(1)).await;

    let writes = store.writes_to(&paths::typing("c1"));
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].op, WriteOp::Update);
    assert_eq!(writes[0].id, "alice");
}

/// true -> false -> true inside the debounce window is one write of `true`
#[tokio::test(start_paused = true)]
async fn test_toggle_inside_window_is_one_write() {
    let (store, clock) = setup_store();
    let typing = TypingCoordinator::new(session_for(&store, &clock, "alice", "Alice"));

    typing.set_typing("c1", true).await;
    sleep(Duration::from_millis(40)).await;
    typing.set_typing("c1", false).await;
    sleep(Duration::from_millis(40)).await;
    typing.set_typing("c1", true).await;
    sleep(Duration::from_secs(1)).await;

    let writes = store.writes_to(&paths::typing("c1"));
    assert_eq!(writes.len(), 1);
    let fields = writes[0].fields.as_ref().unwrap();
    assert_eq!(fields.get("isTyping"), Some(&json!(true)));
    assert_eq!(fields.get("userName"), Some(&json!("Alice")));
    assert_eq!(fields.get("chatId"), Some(&json!("c1")));
}

/// A stop that is taken back before it flushes leaves the remote untouched
#[tokio::test(start_paused = true)]
async fn test_cancelled_stop_writes_nothing() {
    let (store, clock) = setup_store();
    let typing = TypingCoordinator::new(session_for(&store, &clock, "alice", "Alice"));

    typing.set_typing("c1", true).await;
    sleep(Duration::from_millis(600)).await;
    typing.set_typing("c1", false).await;
    sleep(Duration::from_millis(50)).await;
    typing.set_typing("c1", true).await;
    sleep(Duration::from_secs(1)).await;

    assert_eq!(store.writes_to(&paths::typing("c1")).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_deletes_record() {
    let (store, clock) = setup_store();
    let typing = TypingCoordinator::new(session_for(&store, &clock, "alice", "Alice"));

    typing.set_typing("c1", true).await;
    sleep(Duration::from_millis(600)).await;
    assert!(store.get(&paths::typing("c1"), "alice").await.unwrap().is_some());

    typing.set_typing("c1", false).await;
    sleep(Duration::from_millis(150)).await;

    let writes = store.writes_to(&paths::typing("c1"));
    assert_eq!(writes.last().map(|w| w.op), Some(WriteOp::Delete));
    assert!(store.get(&paths::typing("c1"), "alice").await.unwrap().is_none());
}

/// A typist who goes quiet without stopping disappears once the record expires
#[tokio::test(start_paused = true)]
async fn test_peer_dropped_after_expiry() {
    let (store, clock) = setup_store();
    let alice = TypingCoordinator::new(session_for(&store, &clock, "alice", "Alice"));
    let bob = TypingCoordinator::new(session_for(&store, &clock, "bob", "Bob"));

    let (seen, sink) = recorder::<Vec<TypingPeer>>();
    let _watch = bob.subscribe("c1", sink);

    alice.set_typing("c1", true).await;
    sleep(Duration::from_millis(600)).await;
    let shown = latest(&seen).unwrap();
    assert_eq!(shown.len(), 1);
    assert_eq!(shown[0].user_id, "alice");
    assert_eq!(shown[0].user_name, "Alice");

    // Record written at 0.5s with a 5s TTL
    sleep(Duration::from_millis(4800)).await;
    assert_eq!(latest(&seen).unwrap().len(), 1);

    sleep(Duration::from_millis(600)).await;
    assert!(latest(&seen).unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_own_record_is_not_shown() {
    let (store, clock) = setup_store();
    let alice = TypingCoordinator::new(session_for(&store, &clock, "alice", "Alice"));

    let (seen, sink) = recorder::<Vec<TypingPeer>>();
    let _watch = alice.subscribe("c1", sink);
    alice.set_typing("c1", true).await;
    sleep(Duration::from_millis(600)).await;

    assert!(store.get(&paths::typing("c1"), "alice").await.unwrap().is_some());
    let received = seen.lock().unwrap();
    assert_eq!(received.len(), 1, "an unchanged view is delivered once");
    assert!(matches!(&received[0], Ok(peers) if peers.is_empty()));
}

/// Staying active past the refresh interval re-writes the record before it expires
#[tokio::test(start_paused = true)]
async fn test_active_typist_refreshes_record() {
    let (store, clock) = setup_store();
    let typing = TypingCoordinator::new(session_for(&store, &clock, "alice", "Alice"));

    typing.set_typing("c1", true).await;
    sleep(Duration::from_millis(1500)).await;
    typing.set_typing("c1", true).await;
    sleep(Duration::from_secs(1)).await;
    assert_eq!(store.writes_to(&paths::typing("c1")).len(), 1);

    sleep(Duration::from_secs(2)).await;
    typing.set_typing("c1", true).await;
    sleep(Duration::from_secs(1)).await;
    assert_eq!(store.writes_to(&paths::typing("c1")).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_clear_and_dispose_remove_own_record() {
    let (store, clock) = setup_store();
    let typing = TypingCoordinator::new(session_for(&store, &clock, "alice", "Alice"));

    typing.set_typing("c1", true).await;
    sleep(Duration::from_millis(600)).await;
    typing.clear("c1").await.unwrap();
    assert!(store.get(&paths::typing("c1"), "alice").await.unwrap().is_none());

    // Leaving the chat view clears a lingering intent too
    let (_seen, sink) = recorder::<Vec<TypingPeer>>();
    let watch = typing.subscribe("c1", sink);
    typing.set_typing("c1", true).await;
    sleep(Duration::from_millis(600)).await;
    assert!(store.get(&paths::typing("c1"), "alice").await.unwrap().is_some());

    watch.dispose();
    sleep(Duration::from_millis(10)).await;
    assert!(store.get(&paths::typing("c1"), "alice").await.unwrap().is_none());
    assert_eq!(store.subscriber_count(), 0);
}

/// Signing in after the feed opened still hides the user's own record
#[tokio::test(start_paused = true)]
async fn test_own_record_hidden_after_late_sign_in() {
    let (store, clock) = setup_store();
    let session = anonymous_session(&store, &clock);
    let typing = TypingCoordinator::new(session.clone());

    let (seen, sink) = recorder::<Vec<TypingPeer>>();
    let _watch = typing.subscribe("c1", sink);
    sleep(Duration::from_millis(10)).await;

    session.sign_in(LocalUser::new("alice", "Alice"));
    typing.set_typing("c1", true).await;
    sleep(Duration::from_millis(600)).await;

    assert!(store.get(&paths::typing("c1"), "alice").await.unwrap().is_some());
    assert!(latest(&seen).unwrap().is_empty());
    assert!(seen.lock().unwrap().iter().all(|r| matches!(r, Ok(peers) if peers.is_empty())));
}

#[tokio::test(start_paused = true)]
async fn test_no_identity_is_a_no_op() {
    let (store, clock) = setup_store();
    let typing = TypingCoordinator::new(anonymous_session(&store, &clock));

    typing.set_typing("c1", true).await;
    sleep(Duration::from_secs(1)).await;
    typing.clear("c1").await.unwrap();

    assert!(store.writes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_subscription_error_ends_feed() {
    let (store, clock) = setup_store();
    let bob = TypingCoordinator::new(session_for(&store, &clock, "bob", "Bob"));

    let (seen, sink) = recorder::<Vec<TypingPeer>>();
    let _watch = bob.subscribe("c1", sink);
    sleep(Duration::from_millis(10)).await;

    store.fail_subscriptions(&paths::typing("c1"), StoreError::Unavailable("network".to_string()));
    sleep(Duration::from_millis(10)).await;

    let received = seen.lock().unwrap();
    assert!(matches!(received.last(), Some(Err(StoreError::Unavailable(_)))));
}

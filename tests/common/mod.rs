// Common test utilities for integration tests
// Stores, sessions and event helpers shared by every sync test binary

#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, LevelFilter};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::timeout;

use chatterbox_sync::store::{paths, Fields};
use chatterbox_sync::sync::SyncEvent;
use chatterbox_sync::{
    Clock, InMemoryStore, LocalUser, Message, Session, StoreError, SyncConfig, TokioClock,
};

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

/// Fixed wall-clock origin so timestamps in assertions are predictable
pub fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
}

/// A store and clock sharing tokio's timeline
pub fn setup_store() -> (Arc<InMemoryStore>, Arc<dyn Clock>) {
    setup_logging();
    let clock: Arc<dyn Clock> = Arc::new(TokioClock::starting_at(epoch()));
    (Arc::new(InMemoryStore::new(clock.clone())), clock)
}

pub fn session_for(
    store: &Arc<InMemoryStore>,
    clock: &Arc<dyn Clock>,
    uid: &str,
    name: &str,
) -> Arc<Session> {
    Session::new(store.clone())
        .with_clock(clock.clone())
        .with_config(SyncConfig::default())
        .with_user(LocalUser::new(uid, name))
        .into_shared()
}

pub fn anonymous_session(store: &Arc<InMemoryStore>, clock: &Arc<dyn Clock>) -> Arc<Session> {
    Session::new(store.clone()).with_clock(clock.clone()).into_shared()
}

pub fn fields(value: serde_json::Value) -> Fields {
    value.as_object().cloned().unwrap_or_default()
}

/// Write a direct chat between `participants` as another client would have
pub fn seed_chat(store: &InMemoryStore, chat_id: &str, participants: &[&str]) {
    store.put(
        paths::CHATS,
        chat_id,
        fields(json!({
            "type": "direct",
            "participants": participants,
            "updatedAt": epoch().timestamp_millis(),
        })),
    );
}

/// Write a message record authored by another client
pub fn seed_message(store: &InMemoryStore, chat_id: &str, id: &str, sender: &str, text: &str) {
    store.put(
        &paths::messages(chat_id),
        id,
        fields(json!({ "senderId": sender, "text": text, "status": "sent" })),
    );
}

/// Receive sync events until one satisfies `pred`, or give up after five seconds
pub async fn wait_for_event<F>(
    rx: &mut broadcast::Receiver<SyncEvent>,
    mut pred: F,
) -> Option<SyncEvent>
where
    F: FnMut(&SyncEvent) -> bool,
{
    let result = timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return Some(event),
                Ok(event) => debug!("Skipping event {:?}", event),
                Err(broadcast::error::RecvError::Lagged(n)) => debug!("Lagged by {}", n),
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await;
    result.ok().flatten()
}

/// Wait for a rendered timeline of `chat_id` that satisfies `pred`
pub async fn wait_for_timeline<F>(
    rx: &mut broadcast::Receiver<SyncEvent>,
    chat_id: &str,
    mut pred: F,
) -> Option<Vec<Message>>
where
    F: FnMut(&[Message]) -> bool,
{
    match wait_for_event(rx, |event| match event {
        SyncEvent::Timeline { chat_id: id, messages } => id == chat_id && pred(messages),
        _ => false,
    })
    .await
    {
        Some(SyncEvent::Timeline { messages, .. }) => Some(messages),
        _ => None,
    }
}

/// Poll `check` until it returns true, for up to five seconds
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Shared list of every value a feed callback received
pub type Received<T> = Arc<Mutex<Vec<Result<T, StoreError>>>>;

pub fn recorder<T: Send + 'static>() -> (Received<T>, impl FnMut(Result<T, StoreError>) + Send + 'static)
{
    let received: Received<T> = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    (received, move |value| sink.lock().unwrap().push(value))
}

/// The most recent successful value a feed delivered
pub fn latest<T: Clone>(received: &Received<T>) -> Option<T> {
    received
        .lock()
        .unwrap()
        .iter()
        .rev()
        .find_map(|r| r.as_ref().ok().cloned())
}

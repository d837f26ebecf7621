// Chat list
// Recency-sorted chat previews for a user. Confirmed sends patch a preview ahead of the
// next snapshot; the snapshot then replaces the whole list.

use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use super::messages::SyncEvent;
use crate::models::ChatSummary;
use crate::session::Session;
use crate::store::{paths, Disposer, Document, Query, SnapshotEvent, StoreError};

type SummaryCallback = Box<dyn FnMut(Result<Vec<ChatSummary>, StoreError>) + Send>;

struct Feed {
    user_id: String,
    summaries: Vec<ChatSummary>,
    on_change: SummaryCallback,
}

/// Most recently updated first; ties broken by chat id so the order is stable
pub fn sort_summaries(summaries: &mut [ChatSummary]) {
    summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
}

fn decode_summaries(user_id: &str, docs: &[Document]) -> Vec<ChatSummary> {
    docs.iter()
        .filter_map(|doc| match ChatSummary::from_document(doc) {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!("Skipping unreadable chat {} for {}: {}", doc.id, user_id, e);
                None
            }
        })
        .collect()
}

#[derive(Clone)]
pub struct ChatSummaries {
    session: Arc<Session>,
    feeds: Arc<Mutex<HashMap<u64, Feed>>>,
    next_feed: Arc<AtomicU64>,
}

impl ChatSummaries {
    pub fn new(session: Arc<Session>) -> Self {
        ChatSummaries {
            session,
            feeds: Arc::new(Mutex::new(HashMap::new())),
            next_feed: Arc::new(AtomicU64::new(0)),
        }
    }

    fn lock_feeds(feeds: &Mutex<HashMap<u64, Feed>>) -> MutexGuard<'_, HashMap<u64, Feed>> {
        feeds.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Watch the chats `user_id` participates in, newest activity first.
    ///
    /// `on_change` is called with the full sorted list after every snapshot and after
    /// every optimistic preview update. A subscription error is delivered once and
    /// ends the feed. The callback runs under the aggregator's lock and must not call
    /// back into it.
    pub fn subscribe<F>(&self, user_id: &str, on_change: F) -> Disposer
    where
        F: FnMut(Result<Vec<ChatSummary>, StoreError>) + Send + 'static,
    {
        let feed_id = self.next_feed.fetch_add(1, Ordering::SeqCst);
        Self::lock_feeds(&self.feeds).insert(
            feed_id,
            Feed {
                user_id: user_id.to_string(),
                summaries: Vec::new(),
                on_change: Box::new(on_change),
            },
        );

        let query = Query::collection(paths::CHATS).with_array_contains("participants", user_id);
        let (mut events, subscription) = self.session.store().subscribe(query).into_parts();
        info!("Watching chat list of {}", user_id);

        let feeds = self.feeds.clone();
        let user = user_id.to_string();
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let mut feeds = Self::lock_feeds(&feeds);
                let Some(feed) = feeds.get_mut(&feed_id) else {
                    return;
                };
                match event {
                    SnapshotEvent::Snapshot(docs) => {
                        // Authoritative: replaces any optimistic previews wholesale
                        let mut summaries = decode_summaries(&user, &docs);
                        sort_summaries(&mut summaries);
                        feed.summaries = summaries.clone();
                        (feed.on_change)(Ok(summaries));
                    }
                    SnapshotEvent::Error(e) => {
                        error!("Chat list feed for {} failed: {}", user, e);
                        (feed.on_change)(Err(e));
                        feeds.remove(&feed_id);
                        return;
                    }
                }
            }
        });

        let feeds = self.feeds.clone();
        Disposer::new(move || {
            task.abort();
            Self::lock_feeds(&feeds).remove(&feed_id);
        })
        .chain(subscription)
    }

    /// Patch a chat's preview in every live feed ahead of the next snapshot.
    /// Returns how many feeds showed the chat.
    pub fn on_message_confirmed(&self, chat_id: &str, preview_text: &str) -> usize {
        let now = self.session.now();
        let mut feeds = Self::lock_feeds(&self.feeds);
        let mut touched = 0;

        for feed in feeds.values_mut() {
            let Some(summary) = feed.summaries.iter_mut().find(|s| s.id == chat_id) else {
                continue;
            };
            summary.last_message = Some(preview_text.to_string());
            summary.last_message_time = Some(now);
            summary.updated_at = now;
            sort_summaries(&mut feed.summaries);
            debug!("Optimistic preview for {} in {}'s chat list", chat_id, feed.user_id);
            (feed.on_change)(Ok(feed.summaries.clone()));
            touched += 1;
        }
        touched
    }

    /// Apply `Confirmed` events from the message synchronizer until it goes away
    pub fn follow(&self, events: broadcast::Receiver<SyncEvent>) -> JoinHandle<()> {
        let summaries = self.clone();
        tokio::spawn(async move {
            let mut stream = BroadcastStream::new(events);
            while let Some(item) = stream.next().await {
                match item {
                    Ok(SyncEvent::Confirmed { chat_id, message, .. }) => {
                        summaries.on_message_confirmed(&chat_id, &message.preview());
                    }
                    Ok(_) => {}
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!("Chat list fell behind by {} sync events", skipped);
                    }
                }
            }
            debug!("Stopped following message confirmations");
        })
    }

    /// The current list of every live feed for `user_id`
    pub fn current(&self, user_id: &str) -> Option<Vec<ChatSummary>> {
        Self::lock_feeds(&self.feeds)
            .values()
            .find(|f| f.user_id == user_id)
            .map(|f| f.summaries.clone())
    }
}

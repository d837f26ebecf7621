// Typing indicators
// Local intent is debounced into one TTL-bearing record per user under the chat;
// readers drop their own record, stopped records and anything past its expiry.

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::models::{TypingIntent, TypingPeer};
use crate::session::{LocalUser, Session};
use crate::store::{paths, to_fields, Disposer, Document, Query, SnapshotEvent, StoreError};

// Debounce state for one (chat, user)
#[derive(Default)]
struct IntentState {
    broadcast: bool, // Value the remote currently reflects
    desired: bool,   // Value most recently requested by the UI
    last_write: Option<DateTime<Utc>>,
    timer: Option<JoinHandle<()>>,
}

type IntentKey = (String, String); // (chat id, user id)

/// Filter remote typing records into the peers a reader should show.
///
/// Drops `local_uid`'s own record, stopped records and records whose expiry is not
/// after `now`; the rest are ordered by expiry, latest first.
pub fn visible_typists(
    records: &[TypingIntent],
    local_uid: Option<&str>,
    now: DateTime<Utc>,
) -> Vec<TypingPeer> {
    let mut live: Vec<&TypingIntent> = records
        .iter()
        .filter(|r| Some(r.user_id.as_str()) != local_uid && r.is_live(now))
        .collect();
    live.sort_by(|a, b| b.expires_at.cmp(&a.expires_at).then_with(|| a.user_id.cmp(&b.user_id)));
    live.into_iter()
        .map(|r| TypingPeer {
            user_id: r.user_id.clone(),
            user_name: r.user_name.clone(),
        })
        .collect()
}

fn decode_intents(chat_id: &str, docs: &[Document]) -> Vec<TypingIntent> {
    docs.iter()
        .filter_map(|doc| match doc.decode::<TypingIntent>() {
            Ok(intent) => Some(intent),
            Err(e) => {
                warn!("Ignoring malformed typing record in {}: {}", chat_id, e);
                None
            }
        })
        .collect()
}

#[derive(Clone)]
pub struct TypingCoordinator {
    session: Arc<Session>,
    states: Arc<TokioMutex<HashMap<IntentKey, IntentState>>>,
}

impl TypingCoordinator {
    pub fn new(session: Arc<Session>) -> Self {
        TypingCoordinator {
            session,
            states: Arc::new(TokioMutex::new(HashMap::new())),
        }
    }

    /// Record the local user's typing intent for a chat.
    ///
    /// Repeating the current intent does nothing. A change is written after a delay
    /// (longer for start, shorter for stop); a newer change replaces a pending one, and
    /// returning to the value already on the remote cancels the write. Does nothing
    /// before sign-in.
    pub async fn set_typing(&self, chat_id: &str, is_typing: bool) {
        let Some(user) = self.session.current_user() else {
            debug!("Ignoring typing change in {}: no signed-in user", chat_id);
            return;
        };
        let config = self.session.config();
        let now = self.session.now();
        let key = (chat_id.to_string(), user.uid.clone());

        let mut states = self.states.lock().await;
        let state = states.entry(key.clone()).or_default();

        // Keep an active typist's record from expiring under readers
        let refresh_due = is_typing
            && state.broadcast
            && state.timer.is_none()
            && state
                .last_write
                .map_or(false, |t| now - t >= config.typing_refresh());

        if is_typing == state.desired && !refresh_due {
            return;
        }
        state.desired = is_typing;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        if is_typing == state.broadcast && !refresh_due {
            debug!("Typing in {} back to {}, nothing to write", chat_id, is_typing);
            return;
        }

        let delay = if is_typing {
            config.typing_start_delay()
        } else {
            config.typing_stop_delay()
        };
        state.timer = Some(tokio::spawn(self.clone().fire(key, user, is_typing, delay)));
    }

    async fn fire(self, key: IntentKey, user: LocalUser, is_typing: bool, delay: Duration) {
        tokio::time::sleep(delay).await;

        let now = self.session.now();
        {
            let mut states = self.states.lock().await;
            if let Some(state) = states.get_mut(&key) {
                state.timer = None;
                state.broadcast = is_typing;
                if is_typing {
                    state.last_write = Some(now);
                }
            }
        }

        let (chat_id, uid) = &key;
        let result = if is_typing {
            self.write_intent(chat_id, &user, now).await
        } else {
            self.session
                .store()
                .delete(&paths::typing(chat_id), uid)
                .await
                .map_err(anyhow::Error::from)
        };

        if let Err(e) = result {
            warn!("Failed to publish typing={} in {}: {}", is_typing, chat_id, e);
            // Forget the broadcast so the next change is written again
            let mut states = self.states.lock().await;
            if let Some(state) = states.get_mut(&key) {
                if state.broadcast == is_typing && state.timer.is_none() {
                    state.broadcast = !is_typing;
                    state.desired = !is_typing;
                }
            }
        }
    }

    async fn write_intent(&self, chat_id: &str, user: &LocalUser, now: DateTime<Utc>) -> Result<()> {
        let intent = TypingIntent {
            chat_id: chat_id.to_string(),
            user_id: user.uid.clone(),
            user_name: user.display_name.clone(),
            is_typing: true,
            expires_at: now + self.session.config().typing_ttl(),
            last_updated: now,
        };
        let fields = to_fields(&intent)?;
        self.session
            .store()
            .update(&paths::typing(chat_id), &user.uid, fields)
            .await?;
        debug!("Published typing intent in {} until {}", chat_id, intent.expires_at);
        Ok(())
    }

    /// Delete the local user's typing record now, whatever its state
    pub async fn clear(&self, chat_id: &str) -> Result<()> {
        let Some(user) = self.session.current_user() else {
            return Ok(());
        };
        {
            let mut states = self.states.lock().await;
            if let Some(mut state) = states.remove(&(chat_id.to_string(), user.uid.clone())) {
                if let Some(timer) = state.timer.take() {
                    timer.abort();
                }
            }
        }
        self.session
            .store()
            .delete(&paths::typing(chat_id), &user.uid)
            .await?;
        debug!("Cleared typing intent in {}", chat_id);
        Ok(())
    }

    /// Watch who else is typing in a chat.
    ///
    /// `on_change` receives the filtered peer list after every snapshot and whenever a
    /// shown record expires; an unchanged list is not delivered twice. A subscription
    /// error is delivered once and ends the feed. Disposing also clears the local
    /// user's own intent for the chat. The own record is recognized by whoever is signed
    /// in at the time, so signing in after subscribing still hides it.
    pub fn subscribe<F>(&self, chat_id: &str, mut on_change: F) -> Disposer
    where
        F: FnMut(Result<Vec<TypingPeer>, StoreError>) + Send + 'static,
    {
        let session = self.session.clone();
        let clock: Arc<dyn Clock> = self.session.clock();
        let (mut events, subscription) = self
            .session
            .store()
            .subscribe(Query::collection(paths::typing(chat_id)))
            .into_parts();

        let feed_chat = chat_id.to_string();
        let task = tokio::spawn(async move {
            let mut records: Option<Vec<TypingIntent>> = None;
            let mut last_view: Option<Vec<TypingPeer>> = None;

            loop {
                let local_uid = session.current_user().map(|u| u.uid);
                let now = clock.now();
                let mut next_expiry = None;
                if let Some(records) = &records {
                    let view = visible_typists(records, local_uid.as_deref(), now);
                    if last_view.as_ref() != Some(&view) {
                        on_change(Ok(view.clone()));
                        last_view = Some(view);
                    }
                    next_expiry = records
                        .iter()
                        .filter(|r| Some(r.user_id.as_str()) != local_uid.as_deref() && r.is_live(now))
                        .map(|r| r.expires_at)
                        .min();
                }

                let expiry_wait = next_expiry.map(|at| (at - now).to_std().unwrap_or(Duration::ZERO));
                tokio::select! {
                    event = events.recv() => match event {
                        Some(SnapshotEvent::Snapshot(docs)) => {
                            records = Some(decode_intents(&feed_chat, &docs));
                        }
                        Some(SnapshotEvent::Error(e)) => {
                            error!("Typing feed for {} failed: {}", feed_chat, e);
                            on_change(Err(e));
                            return;
                        }
                        None => return,
                    },
                    _ = async {
                        match expiry_wait {
                            Some(wait) => tokio::time::sleep(wait).await,
                            None => std::future::pending::<()>().await,
                        }
                    } => {
                        debug!("Typing record expired in {}", feed_chat);
                    }
                }
            }
        });

        let coordinator = self.clone();
        let chat_id = chat_id.to_string();
        info!("Watching typing in {}", chat_id);
        Disposer::new(move || {
            task.abort();
            // Leaving the chat must not leave our own indicator behind
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    if let Err(e) = coordinator.clear(&chat_id).await {
                        warn!("Failed to clear typing intent in {}: {}", chat_id, e);
                    }
                });
            }
        })
        .chain(subscription)
    }
}

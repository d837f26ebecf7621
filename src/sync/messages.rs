// Message synchronization
// Optimistic local sends, a per-chat outbox, snapshot reconciliation and status transitions.

use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex as TokioMutex};
use uuid::Uuid;

use crate::models::{ContentType, DeliveryStatus, ImageMeta, LocalDeliveryState, Message};
use crate::session::Session;
use crate::store::{paths, Direction, Disposer, Document, Fields, Query, SnapshotEvent, StoreError};
use crate::utils::to_millis;

/// Everything observers of the synchronizer can be told
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// The rendered message list of a chat changed
    Timeline { chat_id: String, messages: Vec<Message> },
    /// A local send was acknowledged by the remote
    Confirmed { chat_id: String, temp_id: String, message: Message },
    /// A create failed; the entry stays `sending` and `text` is handed back for retry
    SendFailed { chat_id: String, temp_id: String, text: String, error: String },
    /// The chat's message subscription died and must be reopened
    SubscriptionFailed { chat_id: String, error: StoreError },
}

/// Merge an authoritative snapshot with local sends.
///
/// Snapshot entries keep the snapshot's order. Local entries follow in submission
/// order, minus any the snapshot already holds (same id, or the snapshot record was
/// created from that local send).
pub fn reconcile(confirmed: &[Message], pending: &[Message]) -> Vec<Message> {
    let known: HashSet<&str> = confirmed
        .iter()
        .flat_map(|m| std::iter::once(m.id.as_str()).chain(m.client_id.as_deref()))
        .collect();

    let mut ordered = confirmed.to_vec();
    ordered.extend(
        pending
            .iter()
            .filter(|local| {
                !known.contains(local.id.as_str())
                    && !local.client_id.as_deref().map_or(false, |c| known.contains(c))
            })
            .cloned(),
    );
    ordered
}

// Status raised locally ahead of the remote write that carries it
#[derive(Debug, Clone)]
struct StatusFloor {
    status: DeliveryStatus,
    readers: BTreeSet<String>,
}

#[derive(Default)]
struct ChatTimeline {
    snapshot: Vec<Message>, // Last authoritative result set
    local: Vec<Message>,    // Own sends not yet seen in a snapshot, in submission order
    floors: HashMap<String, StatusFloor>,
    rendered: Vec<Message>,
}

impl ChatTimeline {
    fn render(&mut self) -> Vec<Message> {
        let confirmed: Vec<Message> = self
            .snapshot
            .iter()
            .map(|m| {
                let mut m = m.clone();
                if let Some(floor) = self.floors.get(&m.id) {
                    if floor.status > m.status {
                        m.status = floor.status;
                    }
                    m.read_by.extend(floor.readers.iter().cloned());
                }
                m
            })
            .collect();
        self.rendered = reconcile(&confirmed, &self.local);
        self.rendered.clone()
    }

    fn apply_snapshot(&mut self, mut records: Vec<Message>) {
        let previous: HashMap<&str, &Message> =
            self.snapshot.iter().map(|m| (m.id.as_str(), m)).collect();

        for record in &mut records {
            record.local_state = LocalDeliveryState::Confirmed;
            // Statuses never move backward and readers are never forgotten, even if a
            // lagging snapshot says otherwise
            if let Some(prev) = previous.get(record.id.as_str()) {
                if prev.status > record.status {
                    record.status = prev.status;
                }
                record.read_by.extend(prev.read_by.iter().cloned());
            }
        }

        // Floors the remote has caught up with, or whose message is gone, are no longer needed
        self.floors.retain(|id, floor| {
            records.iter().find(|r| &r.id == id).map_or(false, |r| {
                r.status < floor.status || !floor.readers.is_subset(&r.read_by)
            })
        });
        self.local
            .retain(|local| !records.iter().any(|r| r.same_send(local)));
        self.snapshot = records;
    }
}

// An outbox task with nothing to send for this long shuts down
const OUTBOX_IDLE: Duration = Duration::from_secs(30);

struct Shared {
    session: Arc<Session>,
    chats: TokioMutex<HashMap<String, ChatTimeline>>,
    outboxes: TokioMutex<HashMap<String, mpsc::UnboundedSender<Message>>>,
    events: broadcast::Sender<SyncEvent>,
}

impl Shared {
    fn emit(&self, event: SyncEvent) {
        if self.events.send(event).is_err() {
            debug!("No listeners for sync event");
        }
    }

    async fn on_remote_confirm(&self, temp_id: &str, canonical: Message) -> Message {
        let chat_id = canonical.chat_id.clone();
        let mut confirmed = canonical;
        confirmed.local_state = LocalDeliveryState::Confirmed;
        if confirmed.status < DeliveryStatus::Sent {
            confirmed.status = DeliveryStatus::Sent;
        }
        if confirmed.client_id.is_none() {
            confirmed.client_id = Some(temp_id.to_string());
        }

        let rendered = {
            let mut chats = self.chats.lock().await;
            let timeline = chats.entry(chat_id.clone()).or_default();
            match timeline.local.iter().position(|m| m.id == temp_id) {
                // Replace in place so the entry keeps its position
                Some(pos) => timeline.local[pos] = confirmed.clone(),
                None if timeline.snapshot.iter().any(|m| m.same_send(&confirmed)) => {
                    debug!("Message {} already arrived in a snapshot", confirmed.id);
                }
                None => {
                    debug!("Confirmation for untracked send {} in {}", temp_id, chat_id);
                    timeline.local.push(confirmed.clone());
                }
            }
            timeline.render()
        };

        info!("Message {} confirmed as {} in {}", temp_id, confirmed.id, chat_id);
        self.emit(SyncEvent::Timeline {
            chat_id: chat_id.clone(),
            messages: rendered,
        });
        self.emit(SyncEvent::Confirmed {
            chat_id,
            temp_id: temp_id.to_string(),
            message: confirmed.clone(),
        });
        confirmed
    }

    async fn on_remote_snapshot(&self, chat_id: &str, records: Vec<Message>) -> Vec<Message> {
        let rendered = {
            let mut chats = self.chats.lock().await;
            let timeline = chats.entry(chat_id.to_string()).or_default();
            timeline.apply_snapshot(records);
            timeline.render()
        };
        debug!("Chat {} now renders {} messages", chat_id, rendered.len());
        self.emit(SyncEvent::Timeline {
            chat_id: chat_id.to_string(),
            messages: rendered.clone(),
        });
        rendered
    }

    // Best-effort preview update on the chat document
    async fn touch_chat(&self, message: &Message) {
        let millis = to_millis(message.timestamp);
        let mut fields = Fields::new();
        fields.insert("lastMessage".to_string(), Value::String(message.preview()));
        fields.insert("lastMessageTime".to_string(), json!(millis));
        fields.insert("updatedAt".to_string(), json!(millis));
        fields.insert("lastSenderId".to_string(), Value::String(message.sender_id.clone()));

        if let Err(e) = self
            .session
            .store()
            .update(paths::CHATS, &message.chat_id, fields)
            .await
        {
            warn!("Failed to update preview of chat {}: {}", message.chat_id, e);
        }
    }

    // Creates are issued one at a time so server timestamps follow submission order
    async fn run_outbox(self: Arc<Self>, chat_id: String, mut jobs: mpsc::UnboundedReceiver<Message>) {
        let collection = paths::messages(&chat_id);
        loop {
            let message = match tokio::time::timeout(OUTBOX_IDLE, jobs.recv()).await {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(_) => {
                    // Deregister under the lock so dispatch never hands us a job we would drop
                    let mut outboxes = self.outboxes.lock().await;
                    match jobs.try_recv() {
                        Ok(message) => message,
                        Err(_) => {
                            outboxes.remove(&chat_id);
                            debug!("Outbox for chat {} idle, shutting down", chat_id);
                            break;
                        }
                    }
                }
            };
            self.send_one(&collection, &chat_id, message).await;
        }
        debug!("Outbox for chat {} closed", chat_id);
    }

    async fn send_one(&self, collection: &str, chat_id: &str, message: Message) {
        let temp_id = message.id.clone();
        let fields = match message.to_create_fields() {
            Ok(fields) => fields,
            Err(e) => {
                self.send_failed(&message, e.to_string());
                return;
            }
        };

        match self.session.store().create(collection, fields).await {
            Ok(doc) => match Message::from_document(chat_id, &doc) {
                Ok(canonical) => {
                    let confirmed = self.on_remote_confirm(&temp_id, canonical).await;
                    self.touch_chat(&confirmed).await;
                }
                // The record exists remotely; the next snapshot reconciles it by client id
                Err(e) => error!("Created {} but could not decode it: {}", doc.id, e),
            },
            Err(e) => {
                warn!("Failed to send message {} in {}: {}", temp_id, chat_id, e);
                self.send_failed(&message, e.to_string());
            }
        }
    }

    fn send_failed(&self, message: &Message, error: String) {
        self.emit(SyncEvent::SendFailed {
            chat_id: message.chat_id.clone(),
            temp_id: message.id.clone(),
            text: message.text.clone(),
            error,
        });
    }
}

fn decode_messages(chat_id: &str, docs: &[Document]) -> Vec<Message> {
    docs.iter()
        .filter_map(|doc| match Message::from_document(chat_id, doc) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!("Skipping undecodable message in {}: {}", chat_id, e);
                None
            }
        })
        .collect()
}

/// Per-chat message lists reconciled against the remote store
#[derive(Clone)]
pub struct MessageSync {
    shared: Arc<Shared>,
}

impl MessageSync {
    pub fn new(session: Arc<Session>) -> Self {
        let (events, _) = broadcast::channel(session.config().event_capacity);
        MessageSync {
            shared: Arc::new(Shared {
                session,
                chats: TokioMutex::new(HashMap::new()),
                outboxes: TokioMutex::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.shared.events.subscribe()
    }

    /// The currently rendered list of a chat
    pub async fn timeline(&self, chat_id: &str) -> Vec<Message> {
        self.shared
            .chats
            .lock()
            .await
            .get(chat_id)
            .map(|t| t.rendered.clone())
            .unwrap_or_default()
    }

    /// Show a message immediately as `sending` and queue its remote create.
    /// Returns the temporary id; the outcome arrives as a `Confirmed` or `SendFailed` event.
    pub async fn submit(&self, chat_id: &str, text: &str, author_id: &str) -> Result<String> {
        if text.trim().is_empty() {
            return Err(anyhow!("Refusing to send an empty message"));
        }
        let message = self.new_outgoing(chat_id, text, author_id)?;
        self.enqueue(message).await
    }

    /// Send an image that has already been uploaded; `caption` may be empty
    pub async fn submit_image(
        &self,
        chat_id: &str,
        image: ImageMeta,
        caption: &str,
        author_id: &str,
    ) -> Result<String> {
        let mut message = self.new_outgoing(chat_id, caption, author_id)?;
        message.content_type = ContentType::Image;
        message.image = Some(image);
        self.enqueue(message).await
    }

    /// Re-issue the create of a send that failed, keeping its temporary id
    pub async fn retry(&self, chat_id: &str, temp_id: &str) -> Result<()> {
        let message = {
            let chats = self.shared.chats.lock().await;
            chats
                .get(chat_id)
                .and_then(|t| t.local.iter().find(|m| m.id == temp_id && m.is_pending()))
                .cloned()
        };
        match message {
            Some(message) => {
                info!("Retrying message {} in {}", temp_id, chat_id);
                self.dispatch(message).await
            }
            None => Err(anyhow!("No pending message {} in chat {}", temp_id, chat_id)),
        }
    }

    /// Swap a temporary entry for its canonical record
    pub async fn on_remote_confirm(&self, temp_id: &str, canonical: Message) -> Message {
        self.shared.on_remote_confirm(temp_id, canonical).await
    }

    /// Apply a full ordered result set from the chat's subscription
    pub async fn on_remote_snapshot(&self, chat_id: &str, records: Vec<Message>) -> Vec<Message> {
        self.shared.on_remote_snapshot(chat_id, records).await
    }

    /// Mark every message from others in the chat as read by `reader_id`.
    /// One status is shared by all participants; there are no per-reader receipts.
    pub async fn mark_read(&self, chat_id: &str, reader_id: &str) -> Result<usize> {
        self.raise_status(chat_id, reader_id, DeliveryStatus::Read).await
    }

    /// Mark every `sent` message from others in the chat as delivered
    pub async fn mark_delivered(&self, chat_id: &str, recipient_id: &str) -> Result<usize> {
        self.raise_status(chat_id, recipient_id, DeliveryStatus::Delivered)
            .await
    }

    /// Forget a chat the UI has left. Keeps it while any of its sends are pending;
    /// returns whether the chat's state was dropped.
    pub async fn release(&self, chat_id: &str) -> bool {
        let mut chats = self.shared.chats.lock().await;
        match chats.get(chat_id) {
            Some(timeline) if timeline.local.iter().any(|m| m.is_pending()) => {
                debug!("Keeping chat {}: sends still pending", chat_id);
                false
            }
            Some(_) => {
                chats.remove(chat_id);
                info!("Released chat {}", chat_id);
                true
            }
            None => false,
        }
    }

    /// Subscribe to the chat's messages, ordered by server time.
    /// A failed subscription is reported once as `SubscriptionFailed` and not reopened.
    pub fn open(&self, chat_id: &str) -> Disposer {
        let query = Query::collection(paths::messages(chat_id)).order_by_create_time(Direction::Ascending);
        let (mut events, subscription) = self.shared.session.store().subscribe(query).into_parts();
        info!("Opening message feed for chat {}", chat_id);

        let shared = self.shared.clone();
        let chat_id = chat_id.to_string();
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    SnapshotEvent::Snapshot(docs) => {
                        let records = decode_messages(&chat_id, &docs);
                        shared.on_remote_snapshot(&chat_id, records).await;
                    }
                    SnapshotEvent::Error(e) => {
                        error!("Message feed for chat {} failed: {}", chat_id, e);
                        shared.emit(SyncEvent::SubscriptionFailed {
                            chat_id: chat_id.clone(),
                            error: e,
                        });
                        return;
                    }
                }
            }
            debug!("Message feed for chat {} ended", chat_id);
        });

        Disposer::new(move || task.abort()).chain(subscription)
    }

    fn new_outgoing(&self, chat_id: &str, text: &str, author_id: &str) -> Result<Message> {
        if author_id.is_empty() {
            return Err(anyhow!("Cannot send without an author"));
        }
        let temp_id = format!("{}{}", self.shared.session.config().temp_id_prefix, Uuid::new_v4());
        Ok(Message::outgoing(
            temp_id,
            chat_id,
            author_id,
            text,
            self.shared.session.now(),
        ))
    }

    async fn enqueue(&self, message: Message) -> Result<String> {
        let temp_id = message.id.clone();
        let chat_id = message.chat_id.clone();

        let rendered = {
            let mut chats = self.shared.chats.lock().await;
            let timeline = chats.entry(chat_id.clone()).or_default();
            timeline.local.push(message.clone());
            timeline.render()
        };
        debug!("Queued message {} in {}", temp_id, chat_id);
        self.shared.emit(SyncEvent::Timeline {
            chat_id,
            messages: rendered,
        });

        self.dispatch(message).await?;
        Ok(temp_id)
    }

    async fn dispatch(&self, message: Message) -> Result<()> {
        let chat_id = message.chat_id.clone();
        let mut outboxes = self.shared.outboxes.lock().await;
        let outbox = match outboxes.get(&chat_id) {
            Some(tx) if !tx.is_closed() => tx.clone(),
            _ => {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(self.shared.clone().run_outbox(chat_id.clone(), rx));
                outboxes.insert(chat_id.clone(), tx.clone());
                tx
            }
        };
        outbox
            .send(message)
            .map_err(|_| anyhow!("Outbox for chat {} is closed", chat_id))
    }

    async fn raise_status(&self, chat_id: &str, user_id: &str, target: DeliveryStatus) -> Result<usize> {
        let changes: Vec<String> = {
            let mut chats = self.shared.chats.lock().await;
            let Some(timeline) = chats.get_mut(chat_id) else {
                return Ok(0);
            };

            let mut changes = Vec::new();
            for message in timeline.rendered.iter() {
                // Read is shared, but every reader still joins readBy
                let done = message.status >= target
                    && (target != DeliveryStatus::Read || message.read_by.contains(user_id));
                if message.is_pending() || message.sender_id == user_id || done {
                    continue;
                }
                let floor = timeline
                    .floors
                    .entry(message.id.clone())
                    .or_insert_with(|| StatusFloor {
                        status: target,
                        readers: BTreeSet::new(),
                    });
                floor.status = floor.status.max(target);

                if target == DeliveryStatus::Read {
                    floor.readers.insert(user_id.to_string());
                }
                changes.push(message.id.clone());
            }

            if !changes.is_empty() {
                let rendered = timeline.render();
                self.shared.emit(SyncEvent::Timeline {
                    chat_id: chat_id.to_string(),
                    messages: rendered,
                });
            }
            changes
        };

        if changes.is_empty() {
            return Ok(0);
        }

        let collection = paths::messages(chat_id);
        let mut fields = Fields::new();
        fields.insert("status".to_string(), json!(target));
        let store = self.shared.session.store();
        let mut failed = Vec::new();
        for id in &changes {
            // readBy only grows: add this reader instead of rewriting the array
            let result = if target == DeliveryStatus::Read {
                store
                    .update_with_union(&collection, id, fields.clone(), "readBy", vec![json!(user_id)])
                    .await
            } else {
                store.update(&collection, id, fields.clone()).await
            };
            if let Err(e) = result {
                warn!("Failed to mark {} as {:?}: {}", id, target, e);
                failed.push(id.clone());
            }
        }

        if failed.is_empty() {
            info!("Marked {} messages in {} as {:?}", changes.len(), chat_id, target);
            return Ok(changes.len());
        }

        // Drop the optimistic raise for writes that never landed so a later call retries them
        let rendered = {
            let mut chats = self.shared.chats.lock().await;
            match chats.get_mut(chat_id) {
                Some(timeline) => {
                    for id in &failed {
                        timeline.floors.remove(id);
                    }
                    Some(timeline.render())
                }
                None => None,
            }
        };
        if let Some(messages) = rendered {
            self.shared.emit(SyncEvent::Timeline {
                chat_id: chat_id.to_string(),
                messages,
            });
        }
        Err(anyhow!(
            "Failed to mark {} of {} messages in {} as {:?}",
            failed.len(),
            changes.len(),
            chat_id,
            target
        ))
    }
}

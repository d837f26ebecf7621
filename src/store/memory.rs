// In-process Remote Store
// Honours the gateway contract (server ids, server timestamps, full-snapshot push delivery,
// error channel, disposers) so the sync engine can run end-to-end without a backend.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, warn};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use super::{Disposer, Document, Fields, Query, RemoteStore, SnapshotEvent, StoreError, Subscription};
use crate::clock::{Clock, SystemClock};

const GENERATED_ID_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Create,
    Update,
    Delete,
}

/// One accepted write, kept so callers can inspect what reached the store
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    pub op: WriteOp,
    pub collection: String,
    pub id: String,
    pub fields: Option<Fields>,
}

struct Subscriber {
    query: Query,
    tx: mpsc::UnboundedSender<SnapshotEvent>,
}

#[derive(Default)]
struct StoreState {
    collections: HashMap<String, BTreeMap<String, Document>>,
    subscribers: HashMap<u64, Subscriber>,
    next_subscriber: u64,
    last_server_time: Option<DateTime<Utc>>,
    writes: Vec<WriteRecord>,
    offline: bool,
    failing_creates: usize,
}

impl StoreState {
    // Server timestamps are strictly increasing at millisecond resolution,
    // the precision documents carry on the wire
    fn server_time(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let now = DateTime::<Utc>::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now);
        let stamp = match self.last_server_time {
            Some(last) if now <= last => last + ChronoDuration::milliseconds(1),
            _ => now,
        };
        self.last_server_time = Some(stamp);
        stamp
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline {
            Err(StoreError::Unavailable("store is offline".to_string()))
        } else {
            Ok(())
        }
    }

    fn snapshot(&self, query: &Query) -> Vec<Document> {
        match self.collections.get(&query.collection) {
            Some(docs) => query.apply(docs.values()),
            None => Vec::new(),
        }
    }

    // Push the new result set to every subscriber of the collection
    fn notify(&mut self, collection: &str) {
        let mut closed = Vec::new();
        for (id, sub) in &self.subscribers {
            if sub.query.collection != collection {
                continue;
            }
            let docs = self.snapshot(&sub.query);
            if sub.tx.send(SnapshotEvent::Snapshot(docs)).is_err() {
                closed.push(*id);
            }
        }
        for id in closed {
            debug!("Dropping closed subscriber {}", id);
            self.subscribers.remove(&id);
        }
    }
}

/// Remote store kept in process memory
#[derive(Clone)]
pub struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        InMemoryStore {
            state: Arc::new(Mutex::new(StoreState::default())),
            clock,
        }
    }

    pub fn with_system_clock() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        // A panic inside a store call must not take every later call down with it
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Simulate losing (or regaining) connectivity: all writes fail while offline
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Make the next `count` creates fail with `Unavailable`
    pub fn fail_next_creates(&self, count: usize) {
        self.lock().failing_creates = count;
    }

    /// Terminate every subscription on `collection` with an error
    pub fn fail_subscriptions(&self, collection: &str, error: StoreError) -> usize {
        let mut state = self.lock();
        let ids: Vec<u64> = state
            .subscribers
            .iter()
            .filter(|(_, s)| s.query.collection == collection)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(sub) = state.subscribers.remove(id) {
                let _ = sub.tx.send(SnapshotEvent::Error(error.clone()));
            }
        }
        warn!("Failed {} subscriptions on {}: {}", ids.len(), collection, error);
        ids.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.lock().writes.clone()
    }

    pub fn writes_to(&self, collection: &str) -> Vec<WriteRecord> {
        self.lock()
            .writes
            .iter()
            .filter(|w| w.collection == collection)
            .cloned()
            .collect()
    }

    /// Write a document with a chosen id, bypassing the offline switch.
    /// Used to seed state written by other clients.
    pub fn put(&self, collection: &str, id: &str, fields: Fields) -> Document {
        let now = self.clock.now();
        let mut state = self.lock();
        let stamp = state.server_time(now);
        let docs = state.collections.entry(collection.to_string()).or_default();
        let doc = match docs.get_mut(id) {
            Some(existing) => {
                existing.fields = fields;
                existing.update_time = stamp;
                existing.clone()
            }
            None => {
                let doc = Document {
                    id: id.to_string(),
                    fields,
                    create_time: stamp,
                    update_time: stamp,
                };
                docs.insert(id.to_string(), doc.clone());
                doc
            }
        };
        state.notify(collection);
        doc
    }

    // Merge-style write shared by `update` and `update_with_union`
    fn merge(
        &self,
        collection: &str,
        id: &str,
        fields: Fields,
        union: Option<(&str, Vec<Value>)>,
    ) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut state = self.lock();
        state.check_online()?;

        let stamp = state.server_time(now);
        let docs = state.collections.entry(collection.to_string()).or_default();
        let doc = docs.entry(id.to_string()).or_insert_with(|| Document {
            id: id.to_string(),
            fields: Fields::new(),
            create_time: stamp,
            update_time: stamp,
        });
        for (key, value) in fields.clone() {
            doc.fields.insert(key, value);
        }
        let mut logged = fields;
        if let Some((array_field, values)) = union {
            let mut items = match doc.fields.remove(array_field) {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            };
            for value in values {
                if !items.contains(&value) {
                    items.push(value);
                }
            }
            doc.fields.insert(array_field.to_string(), Value::Array(items.clone()));
            logged.insert(array_field.to_string(), Value::Array(items));
        }
        doc.update_time = stamp;

        state.writes.push(WriteRecord {
            op: WriteOp::Update,
            collection: collection.to_string(),
            id: id.to_string(),
            fields: Some(logged),
        });
        state.notify(collection);
        Ok(())
    }

    fn generate_id() -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(GENERATED_ID_LEN)
            .map(char::from)
            .collect()
    }
}

#[async_trait]
impl RemoteStore for InMemoryStore {
    async fn create(&self, collection: &str, fields: Fields) -> Result<Document, StoreError> {
        let now = self.clock.now();
        let mut state = self.lock();
        state.check_online()?;
        if state.failing_creates > 0 {
            state.failing_creates -= 1;
            return Err(StoreError::Unavailable("create rejected".to_string()));
        }

        let stamp = state.server_time(now);
        let doc = Document {
            id: Self::generate_id(),
            fields,
            create_time: stamp,
            update_time: stamp,
        };
        state
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(doc.id.clone(), doc.clone());
        state.writes.push(WriteRecord {
            op: WriteOp::Create,
            collection: collection.to_string(),
            id: doc.id.clone(),
            fields: Some(doc.fields.clone()),
        });
        debug!("Created {}/{}", collection, doc.id);
        state.notify(collection);
        Ok(doc)
    }

    async fn update(&self, collection: &str, id: &str, fields: Fields) -> Result<(), StoreError> {
        self.merge(collection, id, fields, None)
    }

    async fn update_with_union(
        &self,
        collection: &str,
        id: &str,
        fields: Fields,
        array_field: &str,
        values: Vec<Value>,
    ) -> Result<(), StoreError> {
        self.merge(collection, id, fields, Some((array_field, values)))
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.check_online()?;

        let removed = state
            .collections
            .get_mut(collection)
            .and_then(|docs| docs.remove(id))
            .is_some();
        state.writes.push(WriteRecord {
            op: WriteOp::Delete,
            collection: collection.to_string(),
            id: id.to_string(),
            fields: None,
        });
        if removed {
            state.notify(collection);
        }
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let state = self.lock();
        Ok(state
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    async fn get_all(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        Ok(self.lock().snapshot(query))
    }

    fn subscribe(&self, query: Query) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();

        let id = state.next_subscriber;
        state.next_subscriber += 1;

        let initial = state.snapshot(&query);
        let _ = tx.send(SnapshotEvent::Snapshot(initial));
        debug!("Subscriber {} listening on {}", id, query.collection);
        state.subscribers.insert(id, Subscriber { query, tx });

        let weak = Arc::downgrade(&self.state);
        let disposer = Disposer::new(move || {
            if let Some(state) = weak.upgrade() {
                let mut state = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                if state.subscribers.remove(&id).is_some() {
                    debug!("Subscriber {} disposed", id);
                }
            }
        });
        Subscription::new(rx, disposer)
    }
}

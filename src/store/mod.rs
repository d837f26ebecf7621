// Remote Store Gateway
// The document store every sync component talks to: one-shot reads, merge-style writes,
// and push subscriptions that deliver the full result set of a query on every change.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;
use tokio::sync::mpsc;

pub mod memory;

pub use memory::{InMemoryStore, WriteOp, WriteRecord};

/// Field map of a stored document
pub type Fields = serde_json::Map<String, Value>;

// Collection paths
pub mod paths {
    pub const CHATS: &str = "chats";
    pub const PRESENCE: &str = "presence";
    pub const USERS: &str = "users";

    pub fn messages(chat_id: &str) -> String {
        format!("{}/{}/messages", CHATS, chat_id)
    }

    pub fn typing(chat_id: &str) -> String {
        format!("{}/{}/typing", CHATS, chat_id)
    }
}

/// Errors reported by the remote store
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("document {collection}/{id} not found")]
    NotFound { collection: String, id: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("invalid document {id}: {reason}")]
    InvalidDocument { id: String, reason: String },
    #[error("subscription closed")]
    Closed,
}

/// A stored document with the metadata the store assigns
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub fields: Fields,
    pub create_time: DateTime<Utc>, // Server timestamp of the create
    pub update_time: DateTime<Utc>, // Server timestamp of the last write
}

impl Document {
    /// Deserialize the document's fields into a wire record
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        serde_json::from_value(Value::Object(self.fields.clone())).map_err(|e| {
            StoreError::InvalidDocument {
                id: self.id.clone(),
                reason: e.to_string(),
            }
        })
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

/// Serialize a wire record into a field map
pub fn to_fields<T: Serialize>(record: &T) -> Result<Fields, StoreError> {
    match serde_json::to_value(record) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(StoreError::InvalidDocument {
            id: String::new(),
            reason: format!("expected an object, got {}", other),
        }),
        Err(e) => Err(StoreError::InvalidDocument {
            id: String::new(),
            reason: e.to_string(),
        }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrderField {
    Field(String),
    CreateTime, // Server-assigned create timestamp
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    ArrayContains(String, Value),
}

impl Filter {
    fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::Eq(field, expected) => doc.get(field) == Some(expected),
            Filter::ArrayContains(field, expected) => match doc.get(field) {
                Some(Value::Array(items)) => items.contains(expected),
                _ => false,
            },
        }
    }
}

/// Query descriptor for reads and subscriptions
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub document: Option<String>, // Single-document query
    pub filters: Vec<Filter>,
    pub order_by: Option<(OrderField, Direction)>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn collection(path: impl Into<String>) -> Self {
        Query {
            collection: path.into(),
            document: None,
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn document(path: impl Into<String>, id: impl Into<String>) -> Self {
        let mut query = Self::collection(path);
        query.document = Some(id.into());
        query
    }

    pub fn with_eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Eq(field.to_string(), value.into()));
        self
    }

    pub fn with_array_contains(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters
            .push(Filter::ArrayContains(field.to_string(), value.into()));
        self
    }

    pub fn order_by(mut self, field: &str, direction: Direction) -> Self {
        self.order_by = Some((OrderField::Field(field.to_string()), direction));
        self
    }

    pub fn order_by_create_time(mut self, direction: Direction) -> Self {
        self.order_by = Some((OrderField::CreateTime, direction));
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether a document of `collection` belongs to this query's result set
    pub fn matches(&self, collection: &str, doc: &Document) -> bool {
        if collection != self.collection {
            return false;
        }
        if let Some(id) = &self.document {
            if &doc.id != id {
                return false;
            }
        }
        self.filters.iter().all(|f| f.matches(doc))
    }

    /// Filter, order and limit the documents of one collection
    pub fn apply<'a>(&self, docs: impl IntoIterator<Item = &'a Document>) -> Vec<Document> {
        let mut result: Vec<Document> = docs
            .into_iter()
            .filter(|d| self.matches(&self.collection, d))
            .cloned()
            .collect();

        if let Some((field, direction)) = &self.order_by {
            result.sort_by(|a, b| {
                let ord = match field {
                    OrderField::CreateTime => a.create_time.cmp(&b.create_time),
                    OrderField::Field(name) => compare_values(a.get(name), b.get(name)),
                }
                .then_with(|| a.id.cmp(&b.id));
                match direction {
                    Direction::Ascending => ord,
                    Direction::Descending => ord.reverse(),
                }
            });
        }

        if let Some(limit) = self.limit {
            result.truncate(limit);
        }
        result
    }
}

// Missing < null < bool < number < string < anything else
fn value_rank(value: Option<&Value>) -> u8 {
    match value {
        None => 0,
        Some(Value::Null) => 1,
        Some(Value::Bool(_)) => 2,
        Some(Value::Number(_)) => 3,
        Some(Value::String(_)) => 4,
        Some(_) => 5,
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => value_rank(a).cmp(&value_rank(b)),
    }
}

/// Event delivered on a subscription channel
#[derive(Debug, Clone)]
pub enum SnapshotEvent {
    Snapshot(Vec<Document>),
    Error(StoreError), // Terminal: nothing follows an error
}

/// Releases a subscription. Disposing consumes the handle, so it runs exactly once;
/// dropping an undisposed handle disposes it as well.
#[must_use = "dropping a Disposer ends the subscription"]
pub struct Disposer {
    teardown: Vec<Box<dyn FnOnce() + Send>>,
}

impl Disposer {
    pub fn new(teardown: impl FnOnce() + Send + 'static) -> Self {
        Disposer {
            teardown: vec![Box::new(teardown)],
        }
    }

    pub fn noop() -> Self {
        Disposer { teardown: Vec::new() }
    }

    /// Run `other` after this disposer's own teardown
    pub fn chain(mut self, mut other: Disposer) -> Self {
        self.teardown.append(&mut other.teardown);
        self
    }

    pub fn dispose(mut self) {
        self.run();
    }

    fn run(&mut self) {
        for teardown in self.teardown.drain(..) {
            teardown();
        }
    }
}

impl Drop for Disposer {
    fn drop(&mut self) {
        self.run();
    }
}

impl std::fmt::Debug for Disposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disposer")
            .field("pending", &self.teardown.len())
            .finish()
    }
}

/// A live push subscription: the event channel plus the handle that ends it
pub struct Subscription {
    events: mpsc::UnboundedReceiver<SnapshotEvent>,
    disposer: Disposer,
}

impl Subscription {
    pub fn new(events: mpsc::UnboundedReceiver<SnapshotEvent>, disposer: Disposer) -> Self {
        Subscription { events, disposer }
    }

    pub fn into_parts(self) -> (mpsc::UnboundedReceiver<SnapshotEvent>, Disposer) {
        (self.events, self.disposer)
    }
}

/// The remote document store
///
/// `update` is a merge: listed fields are overwritten, others are kept, and the
/// document is created when absent. `delete` of a missing document succeeds.
/// Growing sets (`readBy`) go through `update_with_union`, never a whole-array write.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Create a document; the store assigns the id and the server timestamp
    async fn create(&self, collection: &str, fields: Fields) -> Result<Document, StoreError>;

    async fn update(&self, collection: &str, id: &str, fields: Fields) -> Result<(), StoreError>;

    /// `update`, plus adding `values` to the array at `array_field` without duplicating
    /// elements already stored. Concurrent unions from different clients all survive.
    async fn update_with_union(
        &self,
        collection: &str,
        id: &str,
        fields: Fields,
        array_field: &str,
        values: Vec<Value>,
    ) -> Result<(), StoreError>;

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError>;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;

    async fn get_all(&self, query: &Query) -> Result<Vec<Document>, StoreError>;

    /// Open a push subscription. The current result set is delivered first, then a
    /// full result set after every change that touches the query's collection.
    fn subscribe(&self, query: Query) -> Subscription;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(id: &str, fields: Value, secs: i64) -> Document {
        let ts = DateTime::<Utc>::from_timestamp(secs, 0).unwrap();
        Document {
            id: id.to_string(),
            fields: fields.as_object().unwrap().clone(),
            create_time: ts,
            update_time: ts,
        }
    }

    #[test]
    fn test_query_filters_and_orders() {
        let docs = vec![
            doc("a", json!({"participants": ["u1", "u2"], "updatedAt": 30}), 1),
            doc("b", json!({"participants": ["u2", "u3"], "updatedAt": 10}), 2),
            doc("c", json!({"participants": ["u1"], "updatedAt": 20}), 3),
            doc("d", json!({"participants": ["u1"]}), 4),
        ];

        let query = Query::collection("chats")
            .with_array_contains("participants", "u1")
            .order_by("updatedAt", Direction::Descending);
        let ids: Vec<String> = query.apply(&docs).into_iter().map(|d| d.id).collect();

        // Documents without the field sort last when descending
        assert_eq!(ids, vec!["a", "c", "d"]);
    }

    #[test]
    fn test_query_create_time_order_and_limit() {
        let docs = vec![
            doc("late", json!({}), 50),
            doc("early", json!({}), 10),
            doc("middle", json!({}), 20),
        ];
        let query = Query::collection("x")
            .order_by_create_time(Direction::Ascending)
            .with_limit(2);
        let ids: Vec<String> = query.apply(&docs).into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["early", "middle"]);
    }

    #[test]
    fn test_document_query_matches_only_that_id() {
        let query = Query::document("presence", "u1").with_eq("status", "online");
        assert!(query.matches("presence", &doc("u1", json!({"status": "online"}), 1)));
        assert!(!query.matches("presence", &doc("u2", json!({"status": "online"}), 1)));
        assert!(!query.matches("presence", &doc("u1", json!({"status": "offline"}), 1)));
        assert!(!query.matches("users", &doc("u1", json!({"status": "online"}), 1)));
    }

    #[test]
    fn test_disposer_runs_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let count = Arc::new(AtomicUsize::new(0));
        let first = count.clone();
        let second = count.clone();
        let disposer = Disposer::new(move || {
            first.fetch_add(1, Ordering::SeqCst);
        })
        .chain(Disposer::new(move || {
            second.fetch_add(10, Ordering::SeqCst);
        }));

        disposer.dispose();
        assert_eq!(count.load(Ordering::SeqCst), 11);

        // Dropping without disposing still tears down
        let dropped = count.clone();
        {
            let _d = Disposer::new(move || {
                dropped.fetch_add(100, Ordering::SeqCst);
            });
        }
        assert_eq!(count.load(Ordering::SeqCst), 111);
    }
}

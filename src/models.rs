use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::store::{to_fields, Document, Fields, StoreError};

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sending = 1,   // Local only, create not yet acknowledged
    Sent = 2,      // Stored by the remote
    Delivered = 3, // Seen by a recipient's client
    Read = 4,      // Read by a recipient
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    User,
    System,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Text,
    Image,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum LocalDeliveryState {
    Pending,
    Confirmed,
}

/// Metadata of an already-uploaded image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMeta {
    pub url: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String, // Temporary local id until confirmed, then the remote id
    pub chat_id: String,
    pub sender_id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub status: DeliveryStatus,
    pub kind: MessageKind,
    pub content_type: ContentType,
    pub local_state: LocalDeliveryState,
    pub read_by: BTreeSet<String>,
    pub image: Option<ImageMeta>,
    pub client_id: Option<String>, // Temp id of the local send that produced this record
}

// Remote shape of a message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageRecord {
    sender_id: String,
    #[serde(default)]
    text: String,
    status: DeliveryStatus,
    #[serde(default)]
    kind: MessageKind,
    #[serde(default)]
    content_type: ContentType,
    #[serde(default)]
    read_by: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    image: Option<ImageMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_id: Option<String>,
}

impl Message {
    /// A locally originated message, shown before the remote confirms it
    pub fn outgoing(
        temp_id: String,
        chat_id: &str,
        sender_id: &str,
        text: &str,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Message {
            id: temp_id,
            chat_id: chat_id.to_string(),
            sender_id: sender_id.to_string(),
            text: text.to_string(),
            timestamp,
            status: DeliveryStatus::Sending,
            kind: MessageKind::User,
            content_type: ContentType::Text,
            local_state: LocalDeliveryState::Pending,
            read_by: BTreeSet::new(),
            image: None,
            client_id: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.local_state == LocalDeliveryState::Pending
    }

    /// Text shown in chat previews
    pub fn preview(&self) -> String {
        match self.content_type {
            ContentType::Image if self.text.trim().is_empty() => "📷 Photo".to_string(),
            _ => self.text.clone(),
        }
    }

    /// Whether `other` is the same logical send as this message
    pub fn same_send(&self, other: &Message) -> bool {
        self.id == other.id
            || self.client_id.as_deref() == Some(other.id.as_str())
            || other.client_id.as_deref() == Some(self.id.as_str())
            || (self.client_id.is_some() && self.client_id == other.client_id)
    }

    /// Fields written by the remote create. The record is stored as `sent`.
    pub fn to_create_fields(&self) -> Result<Fields, StoreError> {
        to_fields(&MessageRecord {
            sender_id: self.sender_id.clone(),
            text: self.text.clone(),
            status: DeliveryStatus::Sent,
            kind: self.kind,
            content_type: self.content_type,
            read_by: self.read_by.iter().cloned().collect(),
            image: self.image.clone(),
            client_id: Some(self.id.clone()),
        })
    }

    /// Build a confirmed message from a stored document; the server create time
    /// is the message timestamp
    pub fn from_document(chat_id: &str, doc: &Document) -> Result<Self, StoreError> {
        let record: MessageRecord = doc.decode()?;
        Ok(Message {
            id: doc.id.clone(),
            chat_id: chat_id.to_string(),
            sender_id: record.sender_id,
            text: record.text,
            timestamp: doc.create_time,
            status: record.status,
            kind: record.kind,
            content_type: record.content_type,
            local_state: LocalDeliveryState::Confirmed,
            read_by: record.read_by.into_iter().collect(),
            image: record.image,
            client_id: record.client_id,
        })
    }
}

/// A user's typing intent as stored under the chat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingIntent {
    #[serde(default)]
    pub chat_id: String, // Older records may lack it; the path still names the chat
    pub user_id: String,
    pub user_name: String,
    pub is_typing: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_updated: DateTime<Utc>,
}

impl TypingIntent {
    /// Whether a reader at `now` should show this record
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.is_typing && self.expires_at > now
    }
}

/// A peer currently shown as typing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingPeer {
    pub user_id: String,
    pub user_name: String,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PresenceRecord {
    pub uid: String,
    pub status: PresenceStatus,
    pub last_seen: Option<DateTime<Utc>>, // Meaningful only while offline
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PresenceFields {
    status: PresenceStatus,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    last_seen: Option<DateTime<Utc>>,
}

impl PresenceRecord {
    pub fn from_document(doc: &Document) -> Result<Self, StoreError> {
        let fields: PresenceFields = doc.decode()?;
        Ok(PresenceRecord {
            uid: doc.id.clone(),
            status: fields.status,
            last_seen: fields.last_seen,
        })
    }
}

/// What an observer knows about another user's presence
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceView {
    Known(PresenceRecord),
    Unknown, // No record; not the same as offline
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    #[default]
    Direct,
    Group,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatSummary {
    pub id: String,
    pub chat_type: ChatType,
    pub name: Option<String>, // Group chats only
    pub participants: Vec<String>,
    pub last_message: Option<String>,
    pub last_message_time: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatFields {
    #[serde(default, rename = "type")]
    chat_type: ChatType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default)]
    participants: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_message: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    last_message_time: Option<DateTime<Utc>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    updated_at: Option<DateTime<Utc>>,
}

impl ChatSummary {
    /// `updatedAt` falls back to the document's last write time when absent
    pub fn from_document(doc: &Document) -> Result<Self, StoreError> {
        let fields: ChatFields = doc.decode()?;
        Ok(ChatSummary {
            id: doc.id.clone(),
            chat_type: fields.chat_type,
            name: fields.name,
            participants: fields.participants,
            last_message: fields.last_message,
            last_message_time: fields.last_message_time,
            updated_at: fields.updated_at.unwrap_or(doc.update_time),
        })
    }

    pub fn to_fields(&self) -> Result<Fields, StoreError> {
        to_fields(&ChatFields {
            chat_type: self.chat_type,
            name: self.name.clone(),
            participants: self.participants.clone(),
            last_message: self.last_message.clone(),
            last_message_time: self.last_message_time,
            updated_at: Some(self.updated_at),
        })
    }
}

/// Profile fields under `users/{uid}`; last write wins
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(default)]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_token: Option<String>,
}

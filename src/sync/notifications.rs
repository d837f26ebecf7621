// Push notifications
// Registers the local user's delivery token and fans a new message out to the other
// participants' tokens. Per-token failures are logged and counted, never retried.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::future::join_all;
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::models::{ChatSummary, ChatType, Message, UserProfile};
use crate::session::Session;
use crate::store::{paths, Fields};

/// Payload delivered to each recipient device
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushPayload {
    pub chat_id: String,
    pub message_id: String,
    pub sender_name: String,
    pub sender_id: String,
    pub chat_type: ChatType,
}

/// Delivery channel to a device token
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn send(&self, token: &str, payload: &PushPayload) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FanoutReport {
    pub delivered: Vec<String>,         // Recipient uids
    pub failed: Vec<(String, String)>,  // (uid, error)
    pub without_token: Vec<String>,
}

pub struct NotificationFanout {
    session: Arc<Session>,
    transport: Arc<dyn PushTransport>,
}

impl NotificationFanout {
    pub fn new(session: Arc<Session>, transport: Arc<dyn PushTransport>) -> Self {
        NotificationFanout { session, transport }
    }

    /// Store the signed-in user's push token on their profile. Returns false before sign-in.
    pub async fn register_token(&self, token: &str) -> Result<bool> {
        let Some(user) = self.session.current_user() else {
            debug!("Not registering push token: no signed-in user");
            return Ok(false);
        };
        let mut fields = Fields::new();
        fields.insert("pushToken".to_string(), Value::String(token.to_string()));
        fields.insert("displayName".to_string(), Value::String(user.display_name.clone()));
        self.session
            .store()
            .update(paths::USERS, &user.uid, fields)
            .await?;
        info!("Registered push token for {}", user.uid);
        Ok(true)
    }

    async fn profile(&self, uid: &str) -> Option<UserProfile> {
        match self.session.store().get(paths::USERS, uid).await {
            Ok(Some(doc)) => match doc.decode::<UserProfile>() {
                Ok(profile) => Some(profile),
                Err(e) => {
                    warn!("Unreadable profile for {}: {}", uid, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to read profile of {}: {}", uid, e);
                None
            }
        }
    }

    /// Notify every participant of `chat_id` except the sender about `message_id`
    pub async fn dispatch_for(&self, chat_id: &str, message_id: &str) -> Result<FanoutReport> {
        let store = self.session.store();
        let chat_doc = store
            .get(paths::CHATS, chat_id)
            .await?
            .ok_or_else(|| anyhow!("Chat {} not found", chat_id))?;
        let chat = ChatSummary::from_document(&chat_doc)?;

        let message_doc = store
            .get(&paths::messages(chat_id), message_id)
            .await?
            .ok_or_else(|| anyhow!("Message {} not found in chat {}", message_id, chat_id))?;
        let message = Message::from_document(chat_id, &message_doc)?;

        let sender_name = self
            .profile(&message.sender_id)
            .await
            .map(|p| p.display_name)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| message.sender_id.clone());
        let payload = PushPayload {
            chat_id: chat_id.to_string(),
            message_id: message_id.to_string(),
            sender_name,
            sender_id: message.sender_id.clone(),
            chat_type: chat.chat_type,
        };

        let mut report = FanoutReport::default();
        let mut targets = Vec::new();
        for uid in chat.participants.iter().filter(|uid| **uid != message.sender_id) {
            match self.profile(uid).await.and_then(|p| p.push_token) {
                Some(token) => targets.push((uid.clone(), token)),
                None => report.without_token.push(uid.clone()),
            }
        }

        let sends = targets.iter().map(|(uid, token)| {
            let payload = &payload;
            async move { (uid.clone(), self.transport.send(token, payload).await) }
        });
        for (uid, result) in join_all(sends).await {
            match result {
                Ok(()) => report.delivered.push(uid),
                Err(e) => {
                    warn!("Push to {} for message {} failed: {}", uid, message_id, e);
                    report.failed.push((uid, e.to_string()));
                }
            }
        }

        info!(
            "Fan-out for {} in {}: {} delivered, {} failed, {} without token",
            message_id,
            chat_id,
            report.delivered.len(),
            report.failed.len(),
            report.without_token.len()
        );
        Ok(report)
    }
}

// Client sync engine
// Entry point for the sync components. Each feature lives in its own module; ChatClient
// wires them together around one explicitly constructed Session.

use log::info;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub mod chat_list;
pub mod messages;
pub mod notifications;
pub mod presence;
pub mod typing;

pub use chat_list::ChatSummaries;
pub use messages::{reconcile, MessageSync, SyncEvent};
pub use notifications::{FanoutReport, NotificationFanout, PushPayload, PushTransport};
pub use presence::{LifecycleEvent, PresenceManager};
pub use typing::{visible_typists, TypingCoordinator};

use crate::session::Session;

/// The four sync components of one session, with confirmations feeding the chat list
pub struct ChatClient {
    session: Arc<Session>,
    pub messages: MessageSync,
    pub typing: TypingCoordinator,
    pub presence: PresenceManager,
    pub chats: ChatSummaries,
    follower: JoinHandle<()>,
}

impl ChatClient {
    /// Must be called from within a tokio runtime
    pub fn new(session: Arc<Session>) -> Self {
        let messages = MessageSync::new(session.clone());
        let typing = TypingCoordinator::new(session.clone());
        let presence = PresenceManager::new(session.clone());
        let chats = ChatSummaries::new(session.clone());
        let follower = chats.follow(messages.subscribe_events());

        if let Some(user) = session.current_user() {
            info!("Chat client ready for {}", user.uid);
        }
        ChatClient {
            session,
            messages,
            typing,
            presence,
            chats,
            follower,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        self.follower.abort();
    }
}

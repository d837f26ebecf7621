// Presence
// The local user's online/offline record follows app lifecycle transitions;
// other users' records are observed read-only. Presence is advisory only.

use anyhow::Result;
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::models::{PresenceRecord, PresenceStatus, PresenceView};
use crate::session::Session;
use crate::store::{paths, Disposer, Fields, Query, SnapshotEvent, StoreError};
use crate::utils::to_millis;

/// Transitions reported by the mobile lifecycle collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Foreground,
    Background,
    Inactive,
}

impl LifecycleEvent {
    pub fn presence(self) -> PresenceStatus {
        match self {
            LifecycleEvent::Foreground => PresenceStatus::Online,
            LifecycleEvent::Background | LifecycleEvent::Inactive => PresenceStatus::Offline,
        }
    }
}

#[derive(Clone)]
pub struct PresenceManager {
    session: Arc<Session>,
}

impl PresenceManager {
    pub fn new(session: Arc<Session>) -> Self {
        PresenceManager { session }
    }

    /// Mark `uid` online. `lastSeen` is left as it is.
    pub async fn go_online(&self, uid: &str) -> Result<()> {
        if uid.is_empty() {
            debug!("Ignoring go_online without a user");
            return Ok(());
        }
        let mut fields = Fields::new();
        fields.insert("status".to_string(), json!(PresenceStatus::Online));
        self.session
            .store()
            .update(paths::PRESENCE, uid, fields)
            .await?;
        info!("{} is now online", uid);
        Ok(())
    }

    /// Mark `uid` offline, stamping `lastSeen` with the current time
    pub async fn go_offline(&self, uid: &str) -> Result<()> {
        if uid.is_empty() {
            debug!("Ignoring go_offline without a user");
            return Ok(());
        }
        let now = self.session.now();
        let mut fields = Fields::new();
        fields.insert("status".to_string(), json!(PresenceStatus::Offline));
        fields.insert("lastSeen".to_string(), Value::from(to_millis(now)));
        self.session
            .store()
            .update(paths::PRESENCE, uid, fields)
            .await?;
        info!("{} is now offline (last seen {})", uid, now);
        Ok(())
    }

    /// Apply a lifecycle transition to the signed-in user; no-op before sign-in
    pub async fn on_lifecycle(&self, event: LifecycleEvent) -> Result<()> {
        let Some(user) = self.session.current_user() else {
            debug!("Lifecycle {:?} before sign-in, presence unchanged", event);
            return Ok(());
        };
        match event.presence() {
            PresenceStatus::Online => self.go_online(&user.uid).await,
            PresenceStatus::Offline => self.go_offline(&user.uid).await,
        }
    }

    /// Drive presence from a stream of lifecycle events until the sender goes away.
    /// A failed write is logged and the next transition is applied as usual.
    pub async fn run_lifecycle(self, mut events: mpsc::Receiver<LifecycleEvent>) {
        while let Some(event) = events.recv().await {
            if let Err(e) = self.on_lifecycle(event).await {
                warn!("Presence update for {:?} failed: {}", event, e);
            }
        }
        debug!("Lifecycle channel closed");
    }

    /// Watch another user's presence record.
    ///
    /// A missing (or unreadable) record is reported as `Unknown`, never as offline.
    /// A subscription error is delivered once and ends the feed.
    pub fn observe<F>(&self, uid: &str, mut on_change: F) -> Disposer
    where
        F: FnMut(Result<PresenceView, StoreError>) + Send + 'static,
    {
        let (mut events, subscription) = self
            .session
            .store()
            .subscribe(Query::document(paths::PRESENCE, uid))
            .into_parts();

        let uid = uid.to_string();
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    SnapshotEvent::Snapshot(docs) => {
                        let view = match docs.first() {
                            Some(doc) => match PresenceRecord::from_document(doc) {
                                Ok(record) => PresenceView::Known(record),
                                Err(e) => {
                                    warn!("Unreadable presence record for {}: {}", uid, e);
                                    PresenceView::Unknown
                                }
                            },
                            None => PresenceView::Unknown,
                        };
                        on_change(Ok(view));
                    }
                    SnapshotEvent::Error(e) => {
                        error!("Presence feed for {} failed: {}", uid, e);
                        on_change(Err(e));
                        return;
                    }
                }
            }
        });

        Disposer::new(move || task.abort()).chain(subscription)
    }

    /// One-shot read of a user's presence
    pub async fn fetch(&self, uid: &str) -> Result<PresenceView> {
        match self.session.store().get(paths::PRESENCE, uid).await? {
            Some(doc) => Ok(PresenceView::Known(PresenceRecord::from_document(&doc)?)),
            None => Ok(PresenceView::Unknown),
        }
    }
}

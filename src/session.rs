// Session context
// Everything a sync component needs from its surroundings: the store handle, the clock,
// the config and the signed-in identity. Each component receives it at construction.

use chrono::{DateTime, Utc};
use log::info;
use std::sync::{Arc, RwLock};

use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::store::RemoteStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalUser {
    pub uid: String,
    pub display_name: String,
}

impl LocalUser {
    pub fn new(uid: &str, display_name: &str) -> Self {
        LocalUser {
            uid: uid.to_string(),
            display_name: display_name.to_string(),
        }
    }
}

pub struct Session {
    store: Arc<dyn RemoteStore>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    user: RwLock<Option<LocalUser>>, // None until sign-in completes
}

impl Session {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Session {
            store,
            clock: Arc::new(SystemClock),
            config: SyncConfig::default(),
            user: RwLock::new(None),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_user(self, user: LocalUser) -> Self {
        self.sign_in(user);
        self
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn sign_in(&self, user: LocalUser) {
        info!("Session signed in as {}", user.uid);
        *self.user.write().unwrap_or_else(|p| p.into_inner()) = Some(user);
    }

    pub fn sign_out(&self) {
        if let Some(user) = self.user.write().unwrap_or_else(|p| p.into_inner()).take() {
            info!("Session signed out {}", user.uid);
        }
    }

    pub fn current_user(&self) -> Option<LocalUser> {
        self.user.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

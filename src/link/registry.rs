//! # Link Registry
//!
//! Maps a peer address to its active [`OutboundSession`].
//!
//! A newer session for the same address replaces the older one. The
//! observer hears about the new session first; the old one is released and
//! reported lost afterwards, so a device never sits without a session in
//! between.
//!
//! The map lock is held across lookup-then-replace and through the observer
//! callbacks and release that follow, so notifications for one registry are
//! never interleaved. Observers must not call back into the registry.

use crate::core::message::Message;
use crate::core::peer::BtAddress;
use crate::error::{constants, LinkError, Result};
use crate::link::{LinkObserver, OutboundSession};
use crate::utils::Metrics;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// Address to session map shared by the link components
pub struct LinkRegistry {
    sessions: Mutex<HashMap<BtAddress, Arc<OutboundSession>>>,
    observer: Arc<dyn LinkObserver>,
    metrics: Arc<Metrics>,
}

impl LinkRegistry {
    pub fn new(observer: Arc<dyn LinkObserver>, metrics: Arc<Metrics>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            observer,
            metrics,
        }
    }

    /// Store `session` for `address`, replacing any older session
    ///
    /// Storing the session that is already registered is refused.
    pub async fn put(
        &self,
        address: BtAddress,
        identity: &Message,
        session: Arc<OutboundSession>,
    ) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(&address) {
            if Arc::ptr_eq(existing, &session) {
                error!(peer = %address, "Session is already registered, ignoring");
                return Err(LinkError::Registry(constants::ERR_DUPLICATE_SESSION.into()));
            }
        }
        let previous = sessions.insert(address, session.clone());

        info!(peer = %address, replaced = previous.is_some(), "Session registered");
        self.metrics.session_accepted();
        self.observer.on_peer_accepted(identity, session);

        if let Some(old) = previous {
            debug!(peer = %address, "Releasing replaced session");
            self.evict(old);
        }
        drop(sessions);
        Ok(())
    }

    pub async fn get(&self, address: &BtAddress) -> Option<Arc<OutboundSession>> {
        self.sessions.lock().await.get(address).cloned()
    }

    /// Evict the session for `address`, releasing it and reporting it lost
    pub async fn remove(&self, address: &BtAddress) -> Option<Arc<OutboundSession>> {
        let mut sessions = self.sessions.lock().await;
        let removed = sessions.remove(address);
        if let Some(session) = &removed {
            info!(peer = %address, "Session removed");
            self.evict(session.clone());
        }
        drop(sessions);
        removed
    }

    /// Runs with the map lock held
    fn evict(&self, session: Arc<OutboundSession>) {
        session.release_resources();
        self.metrics.session_lost();
        self.observer.on_peer_lost(session);
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Registered addresses, sorted
    pub async fn addresses(&self) -> Vec<BtAddress> {
        let mut addresses: Vec<_> = self.sessions.lock().await.keys().copied().collect();
        addresses.sort();
        addresses
    }
}

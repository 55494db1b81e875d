//! # Link Layer
//!
//! Link establishment between bonded peers.
//!
//! ## Components
//! - **Session**: owns one connection to a peer, sends frames with bounded retries
//! - **Registry**: maps a peer address to its active session
//! - **Acceptor**: reads one inbound frame and routes it
//! - **Listener**: accepts inbound connections one at a time while active
//! - **Announcer**: sends our identity to every bonded peer at startup
//! - **Provider**: owns the lifecycle and wires the components together
//!
//! ## Collaborators
//! The application plugs in through two traits. [`DeviceDirectory`] is the
//! device registry the link layer consults (identity, device lookup,
//! encryption, delivery). [`LinkObserver`] is told when sessions are
//! accepted or lost.

pub mod acceptor;
pub mod announcer;
pub mod listener;
pub mod provider;
pub mod registry;
pub mod session;

pub use acceptor::Acceptor;
pub use listener::ListenerLoop;
pub use provider::LinkProvider;
pub use registry::LinkRegistry;
pub use session::OutboundSession;

use crate::config::LinkConfig;
use crate::core::message::Message;
use crate::core::peer::{BtAddress, PeerIdentity};
use crate::error::Result;
use crate::transport::{BoxedStream, Radio};
use crate::utils::crypto::{self, PrivateKey, PublicKey};
use crate::utils::Metrics;
use std::sync::Arc;
use tracing::{debug, instrument};

/// The application's record of a known device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    pub device_id: String,
    pub bluetooth_address: Option<BtAddress>,
}

impl DeviceHandle {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            bluetooth_address: None,
        }
    }
}

/// Device registry consumed by the link layer
pub trait DeviceDirectory: Send + Sync {
    /// Our own stable device identifier
    fn my_identifier(&self) -> String;

    /// Identity announcement describing this device
    fn create_identity_announcement(&self) -> Message;

    fn resolve_device_by_identifier(&self, device_id: &str) -> Option<DeviceHandle>;

    fn resolve_device_by_address(&self, address: &BtAddress) -> Option<DeviceHandle>;

    /// The session the application currently uses for `device`
    fn current_session_for(&self, device: &DeviceHandle) -> Option<Arc<OutboundSession>>;

    /// Record the Bluetooth address a device was reached at
    fn bind_address(&self, device: &DeviceHandle, address: &BtAddress);

    /// Hand a fully processed inbound message to the application
    fn deliver(&self, message: Message);

    fn private_key(&self) -> &PrivateKey;

    fn encrypt(&self, message: &Message, peer: &PublicKey) -> Result<Message> {
        crypto::seal(message, peer)
    }

    fn decrypt(&self, message: &Message) -> Result<Message> {
        crypto::open(message, self.private_key())
    }
}

/// Told when the registry gains or loses a session
///
/// Callbacks run while the registry map is locked; they must not call back
/// into the registry.
pub trait LinkObserver: Send + Sync {
    fn on_peer_accepted(&self, identity: &Message, session: Arc<OutboundSession>);

    fn on_peer_lost(&self, session: Arc<OutboundSession>);
}

/// Shared handles every link component works with
#[derive(Clone)]
pub struct LinkContext {
    pub radio: Arc<dyn Radio>,
    pub directory: Arc<dyn DeviceDirectory>,
    pub registry: Arc<LinkRegistry>,
    pub config: Arc<LinkConfig>,
    pub metrics: Arc<Metrics>,
}

impl LinkContext {
    pub fn new(
        radio: Arc<dyn Radio>,
        directory: Arc<dyn DeviceDirectory>,
        observer: Arc<dyn LinkObserver>,
        config: LinkConfig,
    ) -> Self {
        let metrics = Arc::new(Metrics::new());
        Self {
            radio,
            directory,
            registry: Arc::new(LinkRegistry::new(observer, metrics.clone())),
            config: Arc::new(config),
            metrics,
        }
    }

    /// New session that connects on its first send
    pub fn new_session(&self, peer: PeerIdentity) -> Arc<OutboundSession> {
        Arc::new(OutboundSession::new(
            peer,
            self.radio.clone(),
            Arc::downgrade(&self.directory),
            self.config.clone(),
            self.metrics.clone(),
        ))
    }

    /// New session around an already connected stream
    pub fn session_with_connection(
        &self,
        peer: PeerIdentity,
        stream: BoxedStream,
    ) -> Arc<OutboundSession> {
        Arc::new(
            OutboundSession::new(
                peer,
                self.radio.clone(),
                Arc::downgrade(&self.directory),
                self.config.clone(),
                self.metrics.clone(),
            )
            .with_connection(stream),
        )
    }

    /// Register a session for a peer that announced itself
    ///
    /// Binds the address to `device` when the application already knows it,
    /// then stores a fresh session under `address`, replacing any older one.
    #[instrument(skip(self, identity, device), fields(peer = %address))]
    pub async fn on_new_peer_available(
        &self,
        identity: Message,
        address: BtAddress,
        device: Option<DeviceHandle>,
    ) {
        if let Some(device) = &device {
            self.directory.bind_address(device, &address);
        }

        let peer = match identity.device_id() {
            Some(device_id) => PeerIdentity::new(address, device_id),
            None => PeerIdentity::from_address(address),
        };
        debug!(%peer, "New peer available");

        let session = self.new_session(peer);
        // Duplicate registrations are already logged by the registry
        let _ = self.registry.put(address, &identity, session).await;
    }
}

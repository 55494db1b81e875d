//! # Link Provider
//!
//! The backend object an application holds. It owns the lifecycle state
//! (the bonded set, the active flag, the listener task) and wires the
//! announcer, listener, acceptor and registry to one shared context.
//!
//! ## Lifecycle
//! - `start`: merge the radio's bonded peers into the bonded set, announce
//!   to all of them, then start the listener
//! - `stop`: clear the active flag and wait for the listener to exit
//! - `on_network_change`: stop, then start
//!
//! Registered sessions survive a stop/start cycle.

use crate::config::LinkConfig;
use crate::core::message::Message;
use crate::core::peer::BtAddress;
use crate::error::Result;
use crate::link::registry::LinkRegistry;
use crate::link::{announcer, DeviceDirectory, DeviceHandle, LinkContext, LinkObserver, ListenerLoop};
use crate::transport::Radio;
use crate::utils::Metrics;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lifecycle-scoped state of one backend
#[derive(Default)]
struct BackendState {
    active: Arc<AtomicBool>,
    bonded: Mutex<BTreeSet<BtAddress>>,
    shutdown: Mutex<Option<mpsc::Sender<()>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

/// Bluetooth link backend
pub struct LinkProvider {
    ctx: LinkContext,
    state: BackendState,
}

impl LinkProvider {
    /// Build a backend; fails if `config` does not validate
    pub fn new(
        radio: Arc<dyn Radio>,
        directory: Arc<dyn DeviceDirectory>,
        observer: Arc<dyn LinkObserver>,
        config: LinkConfig,
    ) -> Result<Self> {
        config.validate_strict()?;
        Ok(Self {
            ctx: LinkContext::new(radio, directory, observer, config),
            state: BackendState::default(),
        })
    }

    pub fn name(&self) -> &'static str {
        "BluetoothLinkProvider"
    }

    pub fn context(&self) -> &LinkContext {
        &self.ctx
    }

    pub fn registry(&self) -> &Arc<LinkRegistry> {
        &self.ctx.registry
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.ctx.metrics
    }

    pub fn is_active(&self) -> bool {
        self.state.active.load(Ordering::SeqCst)
    }

    /// Peers this backend announces to, sorted
    pub fn bonded_devices(&self) -> Vec<BtAddress> {
        lock(&self.state.bonded).iter().copied().collect()
    }

    /// Announce to bonded peers and start listening
    ///
    /// Returns the announcement tasks. Does nothing when the radio is off.
    pub fn start(&self) -> Vec<JoinHandle<bool>> {
        if !self.ctx.radio.is_enabled() {
            warn!("Radio is disabled, link backend not started");
            return Vec::new();
        }

        let peers = {
            let mut bonded = lock(&self.state.bonded);
            bonded.extend(self.ctx.radio.bonded_devices());
            bonded.iter().copied().collect::<Vec<_>>()
        };
        let announcements = announcer::announce_all(&self.ctx, peers);

        // Replacing the sender ends any previous listener
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        *lock(&self.state.shutdown) = Some(shutdown_tx);

        self.state.active.store(true, Ordering::SeqCst);
        let listener = ListenerLoop::new(self.ctx.clone(), self.state.active.clone(), shutdown_rx);
        if let Some(previous) = lock(&self.state.listener).replace(tokio::spawn(listener.run())) {
            previous.abort();
        }

        info!(backend = self.name(), "Link backend started");
        announcements
    }

    /// Stop listening and wait for the listener to exit
    pub async fn stop(&self) {
        self.state.active.store(false, Ordering::SeqCst);
        // Dropping the sender wakes the listener
        lock(&self.state.shutdown).take();

        let listener = lock(&self.state.listener).take();
        if let Some(listener) = listener {
            if let Err(e) = listener.await {
                error!(error = %e, "Listener task failed");
            }
        }

        self.ctx.metrics.log_metrics();
        info!(backend = self.name(), "Link backend stopped");
    }

    pub async fn on_network_change(&self) -> Vec<JoinHandle<bool>> {
        self.stop().await;
        self.start()
    }

    /// A peer was bonded after start
    pub fn add_bonded_device(&self, address: BtAddress) {
        if lock(&self.state.bonded).insert(address) {
            info!(peer = %address, "Bonded device added");
        }
    }

    /// A peer was unbonded; its session is evicted
    pub async fn remove_bonded_device(&self, address: &BtAddress) {
        if lock(&self.state.bonded).remove(address) {
            info!(peer = %address, "Bonded device removed");
        }
        self.ctx.registry.remove(address).await;
    }

    /// Register a session for a peer that announced itself
    pub async fn on_new_peer_available(
        &self,
        identity: Message,
        address: BtAddress,
        device: Option<DeviceHandle>,
    ) {
        self.ctx.on_new_peer_available(identity, address, device).await;
    }
}

//! Shared fixtures for link integration tests
//!
//! A [`TestDevice`] plays the application: it is both the device directory
//! and the registry observer, and records everything it is handed.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use rfcomm_link::config::LinkConfig;
use rfcomm_link::core::message::Message;
use rfcomm_link::core::peer::BtAddress;
use rfcomm_link::transport::memory::{MemoryAir, MemoryRadio};
use rfcomm_link::utils::crypto::{KeyPair, PrivateKey, PublicKey};
use rfcomm_link::{DeviceDirectory, DeviceHandle, LinkObserver, LinkProvider, OutboundSession};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const ADDR_A: BtAddress = BtAddress::new([0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x01]);
pub const ADDR_B: BtAddress = BtAddress::new([0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x02]);
pub const ADDR_C: BtAddress = BtAddress::new([0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x03]);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Accepted(String),
    Lost(BtAddress),
}

/// Application stand-in for one device
pub struct TestDevice {
    pub id: String,
    pub keys: KeyPair,
    known: Mutex<HashMap<String, DeviceHandle>>,
    sessions: Mutex<HashMap<String, Arc<OutboundSession>>>,
    delivered: Mutex<Vec<Message>>,
    events: Mutex<Vec<Event>>,
}

impl TestDevice {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            keys: KeyPair::generate(),
            known: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            delivered: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn public_key(&self) -> PublicKey {
        self.keys.public
    }

    /// Mark a device as already known
    pub fn know(&self, device_id: &str) {
        self.known
            .lock()
            .unwrap()
            .insert(device_id.to_string(), DeviceHandle::new(device_id));
    }

    pub fn known_device(&self, device_id: &str) -> Option<DeviceHandle> {
        self.known.lock().unwrap().get(device_id).cloned()
    }

    pub fn session_for(&self, device_id: &str) -> Option<Arc<OutboundSession>> {
        self.sessions.lock().unwrap().get(device_id).cloned()
    }

    pub fn delivered(&self) -> Vec<Message> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

impl DeviceDirectory for TestDevice {
    fn my_identifier(&self) -> String {
        self.id.clone()
    }

    fn create_identity_announcement(&self) -> Message {
        Message::identity(self.id.clone(), format!("Device {}", self.id), "phone")
    }

    fn resolve_device_by_identifier(&self, device_id: &str) -> Option<DeviceHandle> {
        self.known_device(device_id)
    }

    fn resolve_device_by_address(&self, address: &BtAddress) -> Option<DeviceHandle> {
        self.known
            .lock()
            .unwrap()
            .values()
            .find(|device| device.bluetooth_address.as_ref() == Some(address))
            .cloned()
    }

    fn current_session_for(&self, device: &DeviceHandle) -> Option<Arc<OutboundSession>> {
        self.session_for(&device.device_id)
    }

    fn bind_address(&self, device: &DeviceHandle, address: &BtAddress) {
        if let Some(known) = self.known.lock().unwrap().get_mut(&device.device_id) {
            known.bluetooth_address = Some(*address);
        }
    }

    fn deliver(&self, message: Message) {
        self.delivered.lock().unwrap().push(message);
    }

    fn private_key(&self) -> &PrivateKey {
        &self.keys.private
    }
}

impl LinkObserver for TestDevice {
    fn on_peer_accepted(&self, identity: &Message, session: Arc<OutboundSession>) {
        let device_id = identity.device_id().unwrap_or_default().to_string();
        self.sessions
            .lock()
            .unwrap()
            .insert(device_id.clone(), session);
        self.events.lock().unwrap().push(Event::Accepted(device_id));
    }

    fn on_peer_lost(&self, session: Arc<OutboundSession>) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.retain(|_, held| !Arc::ptr_eq(held, &session));
        drop(sessions);
        self.events
            .lock()
            .unwrap()
            .push(Event::Lost(session.address()));
    }
}

/// Timeouts and backoff short enough for tests
pub fn fast_config() -> LinkConfig {
    LinkConfig::default_with_overrides(|config| {
        config.session.connect_timeout = Duration::from_millis(500);
        config.session.write_timeout = Duration::from_secs(2);
        config.session.payload_timeout = Duration::from_secs(2);
        config.session.retry_backoff = Duration::from_millis(20);
        config.session.max_retry_backoff = Duration::from_millis(80);
        config.announce.retry_backoff = Duration::from_millis(100);
        config.listener.read_timeout = Duration::from_secs(2);
        config.listener.error_backoff = Duration::from_millis(10);
    })
}

/// One device on the shared air
pub struct Node {
    pub device: Arc<TestDevice>,
    pub radio: MemoryRadio,
    pub provider: LinkProvider,
}

pub fn node(air: &MemoryAir, address: BtAddress, id: &str) -> Node {
    node_with_config(air, address, id, fast_config())
}

pub fn node_with_config(air: &MemoryAir, address: BtAddress, id: &str, config: LinkConfig) -> Node {
    let device = TestDevice::new(id);
    let radio = air.radio(address);
    let provider = LinkProvider::new(
        Arc::new(radio.clone()),
        device.clone(),
        device.clone(),
        config,
    )
    .expect("valid config");
    Node {
        device,
        radio,
        provider,
    }
}

/// Poll `condition` until it holds, failing after five seconds
pub async fn wait_until<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Async variant of [`wait_until`]
pub async fn wait_for<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

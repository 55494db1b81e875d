//! # Loopback Radio
//!
//! In-process radios that share one simulated "air".
//!
//! Every [`MemoryRadio`] registers under its address in a [`MemoryAir`].
//! Connecting to a peer hands one end of a `tokio::io::duplex` pipe to the
//! peer's listener and returns the other end, so frames travel through the
//! same codec as they would over a real socket. A connect completes only once
//! the listener has accepted it; a listener dropped with connections still
//! queued fails those connects.
//!
//! ## Behaviour
//! - Service lookup reaches the peer's listener for that service UUID
//! - A numbered channel reaches only a listener opened with `listen_channel`
//! - A disabled radio can neither connect nor be reached; disabling it
//!   closes its listeners
//! - Connect failures can be injected per radio to exercise retry paths

use crate::core::peer::BtAddress;
use crate::error::{constants, LinkError, Result};
use crate::transport::{BoxedStream, ChannelHint, Radio, RfcommListener, RfcommStream, ServiceRecord};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument};
use uuid::Uuid;

const PIPE_CAPACITY: usize = 64 * 1024;
const BACKLOG: usize = 16;

/// A queued connection and the signal that releases its connector
type Incoming = (DuplexStream, BtAddress, oneshot::Sender<()>);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Endpoint {
    Service(Uuid),
    Channel(u8),
}

impl From<ChannelHint> for Endpoint {
    fn from(hint: ChannelHint) -> Self {
        match hint {
            ChannelHint::ServiceLookup(uuid) => Endpoint::Service(uuid),
            ChannelHint::Channel(channel) => Endpoint::Channel(channel),
        }
    }
}

struct Registration {
    id: u64,
    sender: mpsc::Sender<Incoming>,
}

#[derive(Default)]
struct RadioState {
    enabled: bool,
    bonded: HashSet<BtAddress>,
    listeners: HashMap<Endpoint, Registration>,
    injected_failures: u32,
    connect_log: Vec<(BtAddress, ChannelHint)>,
    discovery_cancels: u64,
}

#[derive(Default)]
struct AirInner {
    radios: HashMap<BtAddress, RadioState>,
    next_listener_id: u64,
}

/// Shared medium connecting loopback radios
#[derive(Clone, Default)]
pub struct MemoryAir {
    inner: Arc<Mutex<AirInner>>,
}

impl MemoryAir {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, AirInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Power on a new radio at `address`
    pub fn radio(&self, address: BtAddress) -> MemoryRadio {
        self.lock().radios.entry(address).or_default().enabled = true;
        MemoryRadio {
            address,
            air: self.clone(),
        }
    }

    /// Bond two radios with each other
    pub fn bond(&self, a: BtAddress, b: BtAddress) {
        let mut inner = self.lock();
        inner.radios.entry(a).or_default().bonded.insert(b);
        inner.radios.entry(b).or_default().bonded.insert(a);
    }

    /// Remove the bond between two radios
    pub fn unbond(&self, a: BtAddress, b: BtAddress) {
        let mut inner = self.lock();
        if let Some(state) = inner.radios.get_mut(&a) {
            state.bonded.remove(&b);
        }
        if let Some(state) = inner.radios.get_mut(&b) {
            state.bonded.remove(&a);
        }
    }
}

/// One simulated adapter
#[derive(Clone)]
pub struct MemoryRadio {
    address: BtAddress,
    air: MemoryAir,
}

impl MemoryRadio {
    fn with_state<T>(&self, f: impl FnOnce(&mut RadioState) -> T) -> T {
        let mut inner = self.air.lock();
        f(inner.radios.entry(self.address).or_default())
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.with_state(|state| {
            state.enabled = enabled;
            if !enabled {
                state.listeners.clear();
            }
        });
        debug!(address = %self.address, enabled, "Radio power changed");
    }

    /// Fail the next `count` connect attempts made by this radio
    pub fn fail_next_connects(&self, count: u32) {
        self.with_state(|state| state.injected_failures = count);
    }

    /// Every connect attempt made by this radio, in order
    pub fn connect_log(&self) -> Vec<(BtAddress, ChannelHint)> {
        self.with_state(|state| state.connect_log.clone())
    }

    pub fn connect_attempts(&self) -> usize {
        self.with_state(|state| state.connect_log.len())
    }

    pub fn discovery_cancels(&self) -> u64 {
        self.with_state(|state| state.discovery_cancels)
    }

    /// Listen on a numbered channel, as a peer serving a payload would
    pub fn listen_channel(&self, channel: u8) -> Result<MemoryListener> {
        self.register(Endpoint::Channel(channel))
    }

    fn register(&self, endpoint: Endpoint) -> Result<MemoryListener> {
        let mut inner = self.air.lock();
        inner.next_listener_id += 1;
        let id = inner.next_listener_id;

        let state = inner.radios.entry(self.address).or_default();
        if !state.enabled {
            return Err(LinkError::RadioDisabled);
        }

        let (sender, receiver) = mpsc::channel(BACKLOG);
        state.listeners.insert(endpoint, Registration { id, sender });

        Ok(MemoryListener {
            id,
            endpoint,
            owner: self.address,
            air: self.air.clone(),
            receiver,
        })
    }
}

#[async_trait]
impl Radio for MemoryRadio {
    fn local_address(&self) -> BtAddress {
        self.address
    }

    fn is_enabled(&self) -> bool {
        self.with_state(|state| state.enabled)
    }

    fn bonded_devices(&self) -> Vec<BtAddress> {
        let mut bonded: Vec<_> = self.with_state(|state| state.bonded.iter().copied().collect());
        bonded.sort();
        bonded
    }

    fn is_bonded(&self, address: &BtAddress) -> bool {
        self.with_state(|state| state.bonded.contains(address))
    }

    fn cancel_discovery(&self) {
        self.with_state(|state| state.discovery_cancels += 1);
    }

    async fn listen(&self, service: &ServiceRecord) -> Result<Box<dyn RfcommListener>> {
        let listener = self.register(Endpoint::Service(service.uuid))?;
        debug!(address = %self.address, service = %service.name, "Listening");
        Ok(Box::new(listener))
    }

    #[instrument(level = "debug", skip(self), fields(local = %self.address))]
    async fn connect(&self, address: &BtAddress, hint: ChannelHint) -> Result<BoxedStream> {
        let sender = {
            let mut inner = self.air.lock();

            let local = inner.radios.entry(self.address).or_default();
            local.connect_log.push((*address, hint));
            if !local.enabled {
                return Err(LinkError::RadioDisabled);
            }
            if local.injected_failures > 0 {
                local.injected_failures -= 1;
                return Err(LinkError::ConnectFailed(constants::ERR_INJECTED_FAILURE.into()));
            }

            let remote = inner
                .radios
                .get(address)
                .filter(|state| state.enabled)
                .ok_or_else(|| LinkError::ConnectFailed(constants::ERR_PEER_UNREACHABLE.into()))?;

            remote
                .listeners
                .get(&Endpoint::from(hint))
                .map(|registration| registration.sender.clone())
                .ok_or_else(|| LinkError::ConnectFailed(constants::ERR_NO_LISTENER.into()))?
        };

        let (local_end, remote_end) = tokio::io::duplex(PIPE_CAPACITY);
        let (accepted, on_accept) = oneshot::channel();
        sender
            .try_send((remote_end, self.address, accepted))
            .map_err(|_| LinkError::ConnectFailed(constants::ERR_LISTENER_CLOSED.into()))?;

        on_accept
            .await
            .map_err(|_| LinkError::ConnectFailed(constants::ERR_LISTENER_CLOSED.into()))?;

        debug!(remote = %address, %hint, "Connected");
        Ok(Box::new(MemoryStream::new(local_end, *address)))
    }
}

/// Listening endpoint on a loopback radio
pub struct MemoryListener {
    id: u64,
    endpoint: Endpoint,
    owner: BtAddress,
    air: MemoryAir,
    receiver: mpsc::Receiver<Incoming>,
}

#[async_trait]
impl RfcommListener for MemoryListener {
    async fn accept(&mut self) -> Result<(BoxedStream, BtAddress)> {
        loop {
            let (stream, remote, accepted) = self
                .receiver
                .recv()
                .await
                .ok_or_else(|| LinkError::ConnectFailed(constants::ERR_LISTENER_CLOSED.into()))?;

            if accepted.send(()).is_err() {
                debug!(%remote, "Connector gave up before accept");
                continue;
            }
            return Ok((Box::new(MemoryStream::new(stream, remote)), remote));
        }
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        let mut inner = self.air.lock();
        if let Some(state) = inner.radios.get_mut(&self.owner) {
            if state
                .listeners
                .get(&self.endpoint)
                .is_some_and(|registration| registration.id == self.id)
            {
                state.listeners.remove(&self.endpoint);
            }
        }
    }
}

/// One end of a loopback connection
pub struct MemoryStream {
    inner: DuplexStream,
    remote: BtAddress,
    connected: bool,
}

impl MemoryStream {
    fn new(inner: DuplexStream, remote: BtAddress) -> Self {
        Self {
            inner,
            remote,
            connected: true,
        }
    }
}

impl RfcommStream for MemoryStream {
    fn remote_address(&self) -> BtAddress {
        self.remote
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

impl AsyncRead for MemoryStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        match &poll {
            Poll::Ready(Ok(())) if buf.filled().len() == before && buf.remaining() > 0 => {
                self.connected = false;
            }
            Poll::Ready(Err(_)) => self.connected = false,
            _ => {}
        }
        poll
    }
}

impl AsyncWrite for MemoryStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Err(_)) = &poll {
            self.connected = false;
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.connected = false;
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const A: BtAddress = BtAddress::new([0xA, 0, 0, 0, 0, 1]);
    const B: BtAddress = BtAddress::new([0xB, 0, 0, 0, 0, 2]);

    #[tokio::test]
    async fn test_service_lookup_reaches_listener() {
        let air = MemoryAir::new();
        let a = air.radio(A);
        let b = air.radio(B);

        let mut listener = b.listen(&ServiceRecord::default()).await.unwrap();
        let (client, accepted) = tokio::join!(
            a.connect(&B, ChannelHint::ServiceLookup(ServiceRecord::default().uuid)),
            listener.accept()
        );
        let mut client = client.unwrap();
        assert_eq!(client.remote_address(), B);

        client.write_all(b"hello").await.unwrap();
        client.shutdown().await.unwrap();
        assert!(!client.is_connected());

        let (mut server, remote) = accepted.unwrap();
        assert_eq!(remote, A);
        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello");
    }

    #[tokio::test]
    async fn test_numbered_channel_needs_channel_listener() {
        let air = MemoryAir::new();
        let a = air.radio(A);
        let b = air.radio(B);
        let _service = b.listen(&ServiceRecord::default()).await.unwrap();

        let result = a.connect(&B, ChannelHint::Channel(5)).await;
        assert!(matches!(result, Err(LinkError::ConnectFailed(_))));

        let mut channel = b.listen_channel(5).unwrap();
        let (client, accepted) = tokio::join!(a.connect(&B, ChannelHint::Channel(5)), channel.accept());
        assert!(client.is_ok());
        assert!(accepted.is_ok());
        assert_eq!(a.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_disabling_closes_listeners() {
        let air = MemoryAir::new();
        let b = air.radio(B);
        let mut listener = b.listen(&ServiceRecord::default()).await.unwrap();

        b.set_enabled(false);
        assert!(!b.is_enabled());
        assert!(listener.accept().await.is_err());
        assert!(matches!(
            b.listen(&ServiceRecord::default()).await,
            Err(LinkError::RadioDisabled)
        ));
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let air = MemoryAir::new();
        let a = air.radio(A);
        let b = air.radio(B);
        let mut listener = b.listen(&ServiceRecord::default()).await.unwrap();

        a.fail_next_connects(1);
        let hint = ChannelHint::ServiceLookup(ServiceRecord::default().uuid);
        assert!(a.connect(&B, hint).await.is_err());
        let (client, accepted) = tokio::join!(a.connect(&B, hint), listener.accept());
        assert!(client.is_ok());
        assert!(accepted.is_ok());
    }

    #[tokio::test]
    async fn test_connect_completes_on_accept() {
        let air = MemoryAir::new();
        let a = air.radio(A);
        let b = air.radio(B);
        let mut listener = b.listen(&ServiceRecord::default()).await.unwrap();

        let hint = ChannelHint::ServiceLookup(ServiceRecord::default().uuid);
        let connect = tokio::spawn(async move { a.connect(&B, hint).await.map(|s| s.remote_address()) });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!connect.is_finished());

        let (_server, remote) = listener.accept().await.unwrap();
        assert_eq!(remote, A);
        assert_eq!(connect.await.unwrap().unwrap(), B);
    }

    #[tokio::test]
    async fn test_listener_dropped_before_accept_fails_connect() {
        let air = MemoryAir::new();
        let a = air.radio(A);
        let b = air.radio(B);
        let listener = b.listen(&ServiceRecord::default()).await.unwrap();

        let hint = ChannelHint::ServiceLookup(ServiceRecord::default().uuid);
        let connect = tokio::spawn(async move { a.connect(&B, hint).await.map(|_| ()) });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        drop(listener);

        let result = connect.await.unwrap();
        assert!(matches!(result, Err(LinkError::ConnectFailed(_))));
    }

    #[test]
    fn test_bonding_is_mutual() {
        let air = MemoryAir::new();
        let a = air.radio(A);
        let b = air.radio(B);

        air.bond(A, B);
        assert!(a.is_bonded(&B));
        assert_eq!(b.bonded_devices(), vec![A]);

        air.unbond(A, B);
        assert!(!a.is_bonded(&B));
        assert!(b.bonded_devices().is_empty());
    }

    #[test]
    fn test_dropping_listener_unregisters() {
        let air = MemoryAir::new();
        let b = air.radio(B);
        let first = b.listen_channel(3).unwrap();
        let second = b.listen_channel(3).unwrap();
        drop(first);
        assert!(b.with_state(|state| state.listeners.contains_key(&Endpoint::Channel(3))));
        drop(second);
        assert!(!b.with_state(|state| state.listeners.contains_key(&Endpoint::Channel(3))));
    }
}

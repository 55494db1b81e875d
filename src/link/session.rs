//! # Outbound Session
//!
//! One session per peer. A session owns at most one connection and sends one
//! frame per connection: the frame is written, the write side is closed, and
//! the next send connects again.
//!
//! ## Sending
//! Each send runs on its own task which the caller joins. Sends on the same
//! session serialize on the connection slot; sends to different peers run
//! independently. Connecting is retried a bounded number of times: the first
//! attempts resolve the channel through service lookup, later ones try a
//! random fallback channel.
//!
//! ## Receiving
//! Inbound frames arrive through the acceptor, which hands in-session
//! messages to [`OutboundSession::handle_incoming`] for decryption, payload
//! retrieval and delivery.

use crate::config::{LinkConfig, SessionConfig, FALLBACK_CHANNELS};
use crate::core::frame::{check_payload_size, write_frame, Payload};
use crate::core::message::{Message, MessageType};
use crate::core::peer::{BtAddress, PeerIdentity};
use crate::error::{LinkError, Result};
use crate::link::DeviceDirectory;
use crate::transport::{BoxedStream, ChannelHint, Radio};
use crate::utils::crypto::PublicKey;
use crate::utils::metrics::Timer;
use crate::utils::timeout::with_timeout_error;
use crate::utils::Metrics;
use bytes::Bytes;
use rand::Rng;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Connection held by a session; the lock also serializes sends
type ConnectionSlot = Arc<Mutex<Option<BoxedStream>>>;

/// Outbound half of the link to one peer
pub struct OutboundSession {
    peer: PeerIdentity,
    radio: Arc<dyn Radio>,
    directory: Weak<dyn DeviceDirectory>,
    config: Arc<LinkConfig>,
    metrics: Arc<Metrics>,
    connection: ConnectionSlot,
}

impl fmt::Debug for OutboundSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundSession")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl OutboundSession {
    pub fn new(
        peer: PeerIdentity,
        radio: Arc<dyn Radio>,
        directory: Weak<dyn DeviceDirectory>,
        config: Arc<LinkConfig>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            peer,
            radio,
            directory,
            config,
            metrics,
            connection: Arc::new(Mutex::new(None)),
        }
    }

    /// Start with an already connected stream, used by the first send
    pub fn with_connection(self, stream: BoxedStream) -> Self {
        Self {
            connection: Arc::new(Mutex::new(Some(stream))),
            ..self
        }
    }

    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    pub fn address(&self) -> BtAddress {
        self.peer.address
    }

    pub fn device_id(&self) -> Option<&str> {
        self.peer.device_id.as_deref()
    }

    /// Whether a connection is currently held
    pub async fn has_connection(&self) -> bool {
        self.connection.lock().await.is_some()
    }

    /// Send `message`; an attached payload travels ahead of it
    pub async fn send(&self, mut message: Message) -> bool {
        let payload = message.take_payload().map(Payload::Bytes);
        self.send_with_payload(message, payload).await
    }

    /// Send `message` preceded by `payload`
    #[instrument(skip_all, fields(peer = %self.peer, kind = %message.kind()))]
    pub async fn send_with_payload(&self, message: Message, payload: Option<Payload>) -> bool {
        let worker = SendWorker {
            address: self.peer.address,
            radio: self.radio.clone(),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            connection: self.connection.clone(),
        };

        match tokio::spawn(worker.run(message, payload)).await {
            Ok(Ok(bytes)) => {
                debug!(bytes, "Message sent");
                true
            }
            Ok(Err(e)) => {
                self.metrics.send_failure();
                warn!(error = %e, connection = e.is_connection(), "Send failed");
                false
            }
            Err(e) => {
                self.metrics.send_failure();
                error!(error = %e, "Send worker panicked or was cancelled");
                false
            }
        }
    }

    /// Encrypt `message` for `peer_key`, then send it
    ///
    /// Only the message is encrypted; an attached payload is sent as is.
    pub async fn send_encrypted(&self, mut message: Message, peer_key: &PublicKey) -> bool {
        let Some(directory) = self.directory.upgrade() else {
            warn!(peer = %self.peer, "Device directory is gone, dropping message");
            return false;
        };

        let payload = message.take_payload().map(Payload::Bytes);
        match directory.encrypt(&message, peer_key) {
            Ok(sealed) => self.send_with_payload(sealed, payload).await,
            Err(e) => {
                self.metrics.send_failure();
                error!(peer = %self.peer, error = %e, "Failed to encrypt message");
                false
            }
        }
    }

    /// Finish processing an inbound message and deliver it
    ///
    /// Encrypted messages are decrypted first and dropped if that fails. A
    /// payload announced on a secondary channel is fetched; if fetching fails
    /// the message is still delivered, without payload.
    #[instrument(skip_all, fields(peer = %self.peer, kind = %message.kind()))]
    pub async fn handle_incoming(&self, mut message: Message) {
        let Some(directory) = self.directory.upgrade() else {
            warn!("Device directory is gone, dropping message");
            return;
        };

        if message.kind() == &MessageType::Encrypted {
            let payload = message.take_payload();
            match directory.decrypt(&message) {
                Ok(mut decrypted) => {
                    if let Some(payload) = payload {
                        decrypted.set_payload(payload);
                    }
                    message = decrypted;
                }
                Err(e) => {
                    self.metrics.decryption_failure();
                    error!(error = %e, "Failed to decrypt message, dropping it");
                    return;
                }
            }
        }

        if message.needs_payload_transfer() {
            if let Err(e) = self.fetch_payload(&mut message).await {
                warn!(error = %e, "Failed to fetch payload, delivering without it");
            }
        }

        directory.deliver(message);
    }

    async fn fetch_payload(&self, message: &mut Message) -> Result<()> {
        let Some(info) = message.payload_transfer_info() else {
            return Ok(());
        };
        let policy = &self.config.session;
        let max = self.config.service.max_frame_size;

        self.radio.cancel_discovery();
        let mut stream = with_timeout_error(
            self.radio
                .connect(&self.peer.address, ChannelHint::Channel(info.channel)),
            policy.connect_timeout,
        )
        .await?;

        let payload = match message.payload_size() {
            Some(size) => {
                let mut buffer = vec![0u8; check_payload_size(size, max)?];
                with_timeout_error(
                    async move {
                        stream.read_exact(&mut buffer).await?;
                        Ok::<_, LinkError>(buffer)
                    },
                    policy.payload_timeout,
                )
                .await?
            }
            None => {
                let mut buffer = Vec::new();
                with_timeout_error(
                    async move {
                        stream.take(max as u64).read_to_end(&mut buffer).await?;
                        Ok::<_, LinkError>(buffer)
                    },
                    policy.payload_timeout,
                )
                .await?
            }
        };

        debug!(channel = info.channel, bytes = payload.len(), "Payload fetched");
        message.set_payload(Bytes::from(payload));
        Ok(())
    }

    /// Drop the held connection, if any, without waiting on sends
    ///
    /// A send in flight has already taken the connection out of the slot and
    /// closes it when it finishes.
    pub fn release_resources(&self) {
        match self.connection.try_lock() {
            Ok(mut slot) => {
                if slot.take().is_some() {
                    debug!(peer = %self.peer, "Released connection");
                }
            }
            Err(_) => debug!(peer = %self.peer, "Send in flight, its connection closes when done"),
        }
    }
}

/// One send, run on its own task
struct SendWorker {
    address: BtAddress,
    radio: Arc<dyn Radio>,
    config: Arc<LinkConfig>,
    metrics: Arc<Metrics>,
    connection: ConnectionSlot,
}

impl SendWorker {
    async fn run(self, message: Message, payload: Option<Payload>) -> Result<u64> {
        let _timer = Timer::start("send_frame");
        let mut slot = self.connection.lock().await;

        let mut stream = match slot.take() {
            Some(stream) if stream.is_connected() => {
                debug!(peer = %self.address, "Reusing open connection");
                stream
            }
            _ => {
                connect_with_retry(
                    self.radio.as_ref(),
                    &self.address,
                    self.config.service.uuid,
                    &self.config.session,
                    &self.metrics,
                )
                .await?
            }
        };

        self.radio.cancel_discovery();
        let written = with_timeout_error(
            write_frame(&mut stream, &message, payload),
            self.config.session.write_timeout,
        )
        .await?;

        // The write side is closed now, so the stream cannot carry another frame
        drop(stream);
        drop(slot);

        self.metrics.frame_sent(written);
        Ok(written)
    }
}

fn fallback_channel() -> u8 {
    rand::rng().random_range(FALLBACK_CHANNELS)
}

/// Open a stream to `address`, retrying per `policy`
///
/// Attempts up to `service_lookup_attempts` resolve the channel by service
/// lookup; the rest pick a random fallback channel. Every failure, a disabled
/// radio included, uses up one attempt.
#[instrument(skip_all, fields(peer = %address))]
pub async fn connect_with_retry(
    radio: &dyn Radio,
    address: &BtAddress,
    service: Uuid,
    policy: &SessionConfig,
    metrics: &Metrics,
) -> Result<BoxedStream> {
    for attempt in 1..=policy.connect_attempts {
        let hint = if attempt <= policy.service_lookup_attempts {
            ChannelHint::ServiceLookup(service)
        } else {
            ChannelHint::Channel(fallback_channel())
        };

        metrics.connect_attempt();
        match with_timeout_error(radio.connect(address, hint), policy.connect_timeout).await {
            Ok(stream) => {
                info!(attempt, %hint, "Connected");
                return Ok(stream);
            }
            Err(e) => {
                metrics.connect_failure();
                warn!(attempt, %hint, error = %e, "Connect attempt failed");
            }
        }

        if attempt < policy.connect_attempts {
            tokio::time::sleep(policy.backoff_for(attempt)).await;
        }
    }

    error!(attempts = policy.connect_attempts, "Giving up connecting");
    Err(LinkError::ConnectAttemptsExhausted(policy.connect_attempts))
}

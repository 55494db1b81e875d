//! # Acceptor
//!
//! Handles one inbound connection: reads the frame to end of stream, decodes
//! it, and routes the message.
//!
//! ## Routing
//! - **Identity**: ignored when it is our own; otherwise the device is
//!   resolved by identifier, then by address, and a session is registered
//! - **Session**: delivered through the registered session for the remote
//!   address, or through the application's current session for the device
//!   named by the message or reached at the address

use crate::core::frame::{read_frame, FrameCodec};
use crate::core::message::{Message, Route};
use crate::core::peer::BtAddress;
use crate::error::{LinkError, Result};
use crate::link::{DeviceHandle, LinkContext};
use crate::transport::BoxedStream;
use crate::utils::timeout::with_timeout_error;
use tracing::{debug, info, instrument, warn};

/// Reads and routes inbound frames
pub struct Acceptor {
    ctx: LinkContext,
    codec: FrameCodec,
}

impl Acceptor {
    pub fn new(ctx: LinkContext) -> Self {
        let codec = FrameCodec::new(ctx.config.service.max_frame_size);
        Self { ctx, codec }
    }

    /// Read one frame from `stream` and route it
    #[instrument(skip_all, fields(remote = %remote))]
    pub async fn accept(&self, mut stream: BoxedStream, remote: BtAddress) -> Result<()> {
        self.ctx.metrics.connection_accepted();
        self.ctx.radio.cancel_discovery();

        let mut codec = self.codec;
        let read = with_timeout_error(
            read_frame(&mut stream, &mut codec),
            self.ctx.config.listener.read_timeout,
        )
        .await;
        drop(stream);

        let (frame, wire_len) = match read {
            Ok(read) => read,
            Err(e) => {
                if e.is_framing() {
                    self.ctx.metrics.framing_error();
                }
                return Err(e);
            }
        };
        self.ctx.metrics.frame_received(wire_len);

        let message = frame.into_message();
        debug!(kind = %message.kind(), bytes = wire_len, "Frame received");

        match message.route() {
            Route::Identity => self.on_identity(message, remote).await,
            Route::Session => self.on_session_message(message, remote).await,
        }
    }

    async fn on_identity(&self, message: Message, remote: BtAddress) -> Result<()> {
        let directory = &self.ctx.directory;

        let Some(device_id) = message.device_id() else {
            return Err(LinkError::MalformedFrame(
                "Identity announcement without deviceId".into(),
            ));
        };

        if device_id == directory.my_identifier() {
            debug!("Ignoring our own identity announcement");
            return Ok(());
        }

        let device = directory
            .resolve_device_by_identifier(device_id)
            .or_else(|| directory.resolve_device_by_address(&remote));
        info!(device_id, known = device.is_some(), "Identity announcement received");

        self.ctx.on_new_peer_available(message, remote, device).await;
        Ok(())
    }

    async fn on_session_message(&self, message: Message, remote: BtAddress) -> Result<()> {
        if let Some(session) = self.ctx.registry.get(&remote).await {
            session.handle_incoming(message).await;
            return Ok(());
        }

        let directory = &self.ctx.directory;
        let device: Option<DeviceHandle> = message
            .device_id()
            .and_then(|id| directory.resolve_device_by_identifier(id))
            .or_else(|| directory.resolve_device_by_address(&remote));

        match device.as_ref().and_then(|d| directory.current_session_for(d)) {
            Some(session) => {
                debug!("Routing through the device's current session");
                session.handle_incoming(message).await;
                Ok(())
            }
            None => {
                self.ctx.metrics.routing_failure();
                warn!(
                    kind = %message.kind(),
                    device = ?device.as_ref().map(|d| d.device_id.as_str()),
                    "No session for inbound message"
                );
                Err(LinkError::Routing(format!(
                    "No session for message of type '{}' from {remote}",
                    message.kind()
                )))
            }
        }
    }
}

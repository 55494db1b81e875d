//! # Transport Layer
//!
//! The seam between the link layer and the radio.
//!
//! The link layer never talks to an adapter directly. It consumes a [`Radio`]
//! that can list bonded peers, listen under a service record, and open
//! RFCOMM-style byte streams either by service lookup or by a numbered
//! channel. Streams are plain `AsyncRead + AsyncWrite` so the frame codec
//! runs over them unchanged.
//!
//! ## Implementations
//! - [`memory`]: in-process loopback radio for tests and simulations

pub mod memory;

use crate::config::{ServiceConfig, SERVICE_NAME, SERVICE_UUID};
use crate::core::peer::BtAddress;
use crate::error::Result;
use async_trait::async_trait;
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

/// Service advertised by a listening endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub uuid: Uuid,
    pub name: String,
}

impl ServiceRecord {
    pub fn new(uuid: Uuid, name: impl Into<String>) -> Self {
        Self {
            uuid,
            name: name.into(),
        }
    }
}

impl Default for ServiceRecord {
    fn default() -> Self {
        Self::new(SERVICE_UUID, SERVICE_NAME)
    }
}

impl From<&ServiceConfig> for ServiceRecord {
    fn from(config: &ServiceConfig) -> Self {
        Self::new(config.uuid, config.name.clone())
    }
}

/// How to reach a peer's endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelHint {
    /// Resolve the channel through the peer's service records
    ServiceLookup(Uuid),
    /// Connect to a numbered channel directly
    Channel(u8),
}

impl fmt::Display for ChannelHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelHint::ServiceLookup(uuid) => write!(f, "service {uuid}"),
            ChannelHint::Channel(channel) => write!(f, "channel {channel}"),
        }
    }
}

/// A connected RFCOMM-style byte stream
pub trait RfcommStream: AsyncRead + AsyncWrite + Send + Unpin {
    fn remote_address(&self) -> BtAddress;

    /// Whether the stream is still believed usable for a new frame
    fn is_connected(&self) -> bool;
}

pub type BoxedStream = Box<dyn RfcommStream>;

/// A listening endpoint. Dropping it closes the endpoint.
#[async_trait]
pub trait RfcommListener: Send {
    /// Wait for one inbound connection
    async fn accept(&mut self) -> Result<(BoxedStream, BtAddress)>;
}

/// The local adapter
#[async_trait]
pub trait Radio: Send + Sync {
    fn local_address(&self) -> BtAddress;

    fn is_enabled(&self) -> bool;

    fn bonded_devices(&self) -> Vec<BtAddress>;

    fn is_bonded(&self, address: &BtAddress) -> bool;

    /// Stop any inquiry in progress. Idempotent.
    fn cancel_discovery(&self);

    async fn listen(&self, service: &ServiceRecord) -> Result<Box<dyn RfcommListener>>;

    async fn connect(&self, address: &BtAddress, hint: ChannelHint) -> Result<BoxedStream>;
}

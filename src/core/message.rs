//! # Messages
//!
//! The structured unit two peers exchange. A message has a numeric id, a
//! closed `type` discriminator, a map of string fields, and optionally a
//! binary payload that travels outside the JSON (inline in the frame, or on
//! a secondary channel described by the transfer metadata).
//!
//! ## Wire Format
//! ```text
//! {"id":1700000000000,"type":"identity","body":{"deviceId":"..."},"payloadSize":10,"payloadTransferInfo":{"channel":7}}
//! ```
//!
//! `type` is never empty: deserialization rejects a missing or empty type, so
//! a well-formed frame always yields exactly one message.

use crate::config::PROTOCOL_VERSION;
use crate::error::{constants, LinkError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Wire name of identity announcements
pub const TYPE_IDENTITY: &str = "identity";

/// Wire name of encrypted envelopes
pub const TYPE_ENCRYPTED: &str = "encrypted";

/// Field carrying the sender's stable device identifier
pub const FIELD_DEVICE_ID: &str = "deviceId";
pub const FIELD_DEVICE_NAME: &str = "deviceName";
pub const FIELD_DEVICE_TYPE: &str = "deviceType";
pub const FIELD_PROTOCOL_VERSION: &str = "protocolVersion";

/// Message `type` discriminator
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MessageType {
    /// Announces the sender's identity; bootstraps a session
    Identity,
    /// Envelope produced by the encryption transform
    Encrypted,
    /// Any other application-level type, by wire name
    Application(String),
}

impl MessageType {
    /// Application type by wire name
    pub fn application(name: impl Into<String>) -> Self {
        Self::from_wire(name.into())
    }

    fn from_wire(name: String) -> Self {
        match name.as_str() {
            TYPE_IDENTITY => MessageType::Identity,
            TYPE_ENCRYPTED => MessageType::Encrypted,
            _ => MessageType::Application(name),
        }
    }

    /// Wire name of this type
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Identity => TYPE_IDENTITY,
            MessageType::Encrypted => TYPE_ENCRYPTED,
            MessageType::Application(name) => name,
        }
    }
}

impl TryFrom<String> for MessageType {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        if value.trim().is_empty() {
            return Err(constants::ERR_MISSING_TYPE.to_string());
        }
        Ok(MessageType::from_wire(value))
    }
}

impl From<MessageType> for String {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::Application(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an inbound message is dispatched by the acceptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Create or replace a session for the sender
    Identity,
    /// Belongs to an existing session
    Session,
}

impl Route {
    pub fn for_type(kind: &MessageType) -> Self {
        match kind {
            MessageType::Identity => Route::Identity,
            MessageType::Encrypted | MessageType::Application(_) => Route::Session,
        }
    }
}

/// Secondary channel the payload is served on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadTransferInfo {
    /// RFCOMM channel number to connect to
    pub channel: u8,
}

/// Structured unit exchanged between peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Creation time in milliseconds since the epoch
    pub id: i64,

    #[serde(rename = "type")]
    kind: MessageType,

    #[serde(default)]
    body: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload_size: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload_transfer_info: Option<PayloadTransferInfo>,

    #[serde(skip)]
    payload: Option<Bytes>,
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

impl Message {
    /// New message of `kind` stamped with the current time
    pub fn new(kind: MessageType) -> Self {
        Self::with_id(now_millis(), kind)
    }

    pub fn with_id(id: i64, kind: MessageType) -> Self {
        Self {
            id,
            kind,
            body: BTreeMap::new(),
            payload_size: None,
            payload_transfer_info: None,
            payload: None,
        }
    }

    /// Identity announcement for the local device
    pub fn identity(
        device_id: impl Into<String>,
        device_name: impl Into<String>,
        device_type: impl Into<String>,
    ) -> Self {
        Self::new(MessageType::Identity)
            .with_field(FIELD_DEVICE_ID, device_id)
            .with_field(FIELD_DEVICE_NAME, device_name)
            .with_field(FIELD_DEVICE_TYPE, device_type)
            .with_field(FIELD_PROTOCOL_VERSION, PROTOCOL_VERSION.to_string())
    }

    pub fn kind(&self) -> &MessageType {
        &self.kind
    }

    pub fn route(&self) -> Route {
        Route::for_type(&self.kind)
    }

    pub fn is_identity(&self) -> bool {
        self.kind == MessageType::Identity
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_field(key, value);
        self
    }

    pub fn set_field(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.body.insert(key.into(), value.into());
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.body.get(key).map(String::as_str)
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.body
    }

    /// Sender's device identifier, if the message declares one
    pub fn device_id(&self) -> Option<&str> {
        self.field(FIELD_DEVICE_ID)
    }

    /// Attach an inline payload; also records its size
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.set_payload(payload.into());
        self
    }

    pub fn set_payload(&mut self, payload: Bytes) {
        self.payload_size = Some(payload.len() as u64);
        self.payload = Some(payload);
    }

    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    pub fn has_payload(&self) -> bool {
        self.payload.is_some()
    }

    /// Detach the inline payload, leaving the declared size in place
    pub fn take_payload(&mut self) -> Option<Bytes> {
        self.payload.take()
    }

    pub fn payload_size(&self) -> Option<u64> {
        self.payload_size
    }

    /// Announce a payload of `size` bytes served on a secondary channel
    pub fn with_payload_transfer(mut self, size: u64, info: PayloadTransferInfo) -> Self {
        self.payload_size = Some(size);
        self.payload_transfer_info = Some(info);
        self
    }

    pub fn payload_transfer_info(&self) -> Option<PayloadTransferInfo> {
        self.payload_transfer_info
    }

    /// Whether the payload must be fetched from a secondary channel
    pub fn needs_payload_transfer(&self) -> bool {
        self.payload.is_none() && self.payload_transfer_info.is_some()
    }

    /// Serialize to UTF-8 JSON (payload excluded)
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse UTF-8 JSON
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| LinkError::MalformedFrame(constants::ERR_NOT_UTF8.into()))?;
        Ok(serde_json::from_str(text)?)
    }
}

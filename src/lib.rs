//! # rfcomm-link
//!
//! Link establishment and framing for exchanging structured messages between
//! bonded devices over RFCOMM-style byte streams.
//!
//! A device announces its identity to every previously bonded peer, accepts
//! inbound connections one at a time, and carries one message (with an
//! optional binary payload) per connection using a delimiter-based frame.
//! Outbound sends reuse a held connection or open a new one with bounded
//! retries.
//!
//! ## Layout
//! - [`core`]: message model, peer addressing, frame codec
//! - [`transport`]: radio and stream traits, loopback radio
//! - [`link`]: sessions, registry, acceptor, listener, announcer, provider
//! - [`utils`]: crypto transform, logging, metrics, timeouts
//! - [`config`]: protocol constants and backend configuration
//! - [`error`]: error types
//!
//! ## Example
//! ```no_run
//! use rfcomm_link::config::LinkConfig;
//! use rfcomm_link::core::frame::{decode, encode};
//! use rfcomm_link::core::message::{Message, MessageType};
//!
//! # fn main() -> rfcomm_link::error::Result<()> {
//! let message = Message::new(MessageType::application("ping"));
//! let frame = encode(&message, Some(b"0123456789"))?;
//!
//! let (payload, decoded) = decode(&frame)?;
//! assert_eq!(payload.as_deref(), Some(&b"0123456789"[..]));
//! assert_eq!(decoded.kind(), message.kind());
//! # let _ = LinkConfig::default();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod link;
pub mod transport;
pub mod utils;

pub use crate::core::{BtAddress, Message, MessageType};
pub use crate::error::{LinkError, Result};
pub use crate::link::{DeviceDirectory, DeviceHandle, LinkObserver, LinkProvider, OutboundSession};

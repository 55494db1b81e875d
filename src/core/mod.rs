//! # Core Protocol Components
//!
//! The wire format: messages, peer addressing, and the frame codec.
//!
//! ## Components
//! - **Message**: JSON message model with a closed `type` discriminator
//! - **Peer**: Bluetooth addresses and peer identities
//! - **Frame**: delimiter codec for one message (plus payload) per connection
//!
//! ## Wire Format
//! ```text
//! [payload bytes]? ["Bluetooth Nonce"]? [UTF-8 JSON message]
//! ```

pub mod frame;
pub mod message;
pub mod peer;

pub use frame::{Frame, FrameCodec, Payload};
pub use message::{Message, MessageType, PayloadTransferInfo, Route};
pub use peer::{BtAddress, PeerIdentity};

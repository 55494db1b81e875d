//! # Error Types
//!
//! Error handling for the link layer.
//!
//! Every failure that can occur while framing, connecting, accepting or routing
//! is a variant of [`LinkError`]. None of them escape the link layer as a panic:
//! sessions turn them into a `false` send result, the listener and acceptor log
//! them and move on to the next connection.
//!
//! ## Error Categories
//! - **Framing**: empty, malformed or oversized frames
//! - **Connection**: socket I/O, connect failures, exhausted retry bounds, timeouts
//! - **Cryptographic**: the opaque encrypt/decrypt transform failed
//! - **Routing**: an in-session message has no session or device to go to
//! - **Configuration**: invalid settings
//!
//! ## Example Usage
//! ```rust
//! use rfcomm_link::core::frame::decode;
//! use rfcomm_link::error::LinkError;
//!
//! match decode(&[]) {
//!     Err(LinkError::EmptyFrame) => {}
//!     other => panic!("zero bytes must never decode: {other:?}"),
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Framing errors
    pub const ERR_MISSING_TYPE: &str = "Message type must not be empty";
    pub const ERR_NOT_UTF8: &str = "Serialized message is not valid UTF-8";
    pub const ERR_OVERSIZED_PAYLOAD: &str = "Payload too large";
    pub const ERR_DELIMITER_IN_PAYLOAD: &str = "Payload contains the frame delimiter";

    /// Connection errors
    pub const ERR_NO_LISTENER: &str = "No listener registered for the requested service or channel";
    pub const ERR_PEER_UNREACHABLE: &str = "Peer is not in range";
    pub const ERR_LISTENER_CLOSED: &str = "Listening endpoint closed";
    pub const ERR_INJECTED_FAILURE: &str = "Injected connect failure";

    /// Cryptographic errors
    pub const ERR_MISSING_ENVELOPE_FIELD: &str = "Encrypted message is missing an envelope field";
    pub const ERR_DECRYPTION_FAILED: &str = "Decryption failed";
    pub const ERR_ENCRYPTION_FAILED: &str = "Encryption failed";

    /// Registry errors
    pub const ERR_DUPLICATE_SESSION: &str = "Session is already registered for this address";
}

/// Primary error type for all link operations
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Empty frame: 0 bytes of data received")]
    EmptyFrame,

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Frame too large: {0} bytes")]
    OversizedFrame(usize),

    #[error("Invalid Bluetooth address: {0}")]
    InvalidAddress(String),

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Gave up connecting after {0} attempts")]
    ConnectAttemptsExhausted(u32),

    #[error("Radio is disabled")]
    RadioDisabled,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Routing error: {0}")]
    Routing(String),

    #[error("Registry invariant violated: {0}")]
    Registry(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl LinkError {
    /// Whether this error belongs to the framing category
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            LinkError::EmptyFrame
                | LinkError::MalformedFrame(_)
                | LinkError::OversizedFrame(_)
                | LinkError::Serialization(_)
        )
    }

    /// Whether this error belongs to the connection category
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            LinkError::Io(_)
                | LinkError::ConnectFailed(_)
                | LinkError::ConnectAttemptsExhausted(_)
                | LinkError::RadioDisabled
                | LinkError::Timeout
        )
    }
}

/// Type alias for Results using LinkError
pub type Result<T> = std::result::Result<T, LinkError>;

//! # Utility Modules
//!
//! Supporting utilities shared by the link components.
//!
//! ## Components
//! - **Crypto**: sealed-box transform (X25519 + XChaCha20-Poly1305) for encrypted messages
//! - **Logging**: Structured logging configuration
//! - **Metrics**: Thread-safe observability counters
//! - **Timeout**: Async timeout wrappers
//!
//! ## Security
//! - Cryptographically secure RNG (getrandom)
//! - Memory zeroing for private keys (zeroize crate)

pub mod crypto;
pub mod logging;
pub mod metrics;
pub mod timeout;

pub use metrics::{Metrics, MetricsSnapshot};

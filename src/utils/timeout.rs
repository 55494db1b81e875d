//! Async timeout helpers.
//!
//! A thin wrapper over `tokio::time::timeout` that folds an elapsed deadline
//! into [`LinkError::Timeout`] so callers can use `?` uniformly.

use crate::error::{LinkError, Result};
use std::future::Future;
use std::time::Duration;

/// Default deadline for reads and writes of a whole frame
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default deadline for a single connection attempt
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Run a fallible future with a deadline
pub async fn with_timeout_error<F, T>(future: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(LinkError::Timeout),
    }
}

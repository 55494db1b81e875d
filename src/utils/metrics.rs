//! Observability and Metrics
//!
//! Counters for link activity: connection attempts, frames in and out,
//! crypto and routing failures, registry churn.
//!
//! Uses atomic counters for thread-safe metrics collection. One instance is
//! owned by each backend and shared by its components.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Metrics collector for link operations
#[derive(Debug)]
pub struct Metrics {
    /// Outbound connection attempts (every try, including retries)
    pub connect_attempts: AtomicU64,
    /// Outbound connection attempts that failed
    pub connect_failures: AtomicU64,
    /// Inbound connections handed to the acceptor
    pub connections_accepted: AtomicU64,
    /// Frames written successfully
    pub frames_sent: AtomicU64,
    /// Frames decoded successfully
    pub frames_received: AtomicU64,
    /// Total bytes written
    pub bytes_sent: AtomicU64,
    /// Total bytes read
    pub bytes_received: AtomicU64,
    /// Sends that reported failure
    pub send_failures: AtomicU64,
    /// Empty, malformed or oversized inbound frames
    pub framing_errors: AtomicU64,
    /// Encrypted messages that could not be decrypted
    pub decryption_failures: AtomicU64,
    /// In-session messages with no session or device to go to
    pub routing_failures: AtomicU64,
    /// Identity announcements delivered to bonded peers
    pub announcements_sent: AtomicU64,
    /// Sessions registered
    pub sessions_accepted: AtomicU64,
    /// Sessions evicted
    pub sessions_lost: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connect_attempts: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            connections_accepted: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            framing_errors: AtomicU64::new(0),
            decryption_failures: AtomicU64::new(0),
            routing_failures: AtomicU64::new(0),
            announcements_sent: AtomicU64::new(0),
            sessions_accepted: AtomicU64::new(0),
            sessions_lost: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record an outbound connection attempt
    pub fn connect_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed outbound connection attempt
    pub fn connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an accepted inbound connection
    pub fn connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a frame written
    pub fn frame_sent(&self, byte_count: u64) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a frame decoded
    pub fn frame_received(&self, byte_count: u64) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a failed send
    pub fn send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a framing error
    pub fn framing_error(&self) {
        self.framing_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a decryption failure
    pub fn decryption_failure(&self) {
        self.decryption_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an unroutable message
    pub fn routing_failure(&self) {
        self.routing_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a delivered identity announcement
    pub fn announcement_sent(&self) {
        self.announcements_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a registered session
    pub fn session_accepted(&self) {
        self.sessions_accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an evicted session
    pub fn session_lost(&self) {
        self.sessions_lost.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            framing_errors: self.framing_errors.load(Ordering::Relaxed),
            decryption_failures: self.decryption_failures.load(Ordering::Relaxed),
            routing_failures: self.routing_failures.load(Ordering::Relaxed),
            announcements_sent: self.announcements_sent.load(Ordering::Relaxed),
            sessions_accepted: self.sessions_accepted.load(Ordering::Relaxed),
            sessions_lost: self.sessions_lost.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connect_attempts = snapshot.connect_attempts,
            connect_failures = snapshot.connect_failures,
            connections_accepted = snapshot.connections_accepted,
            frames_sent = snapshot.frames_sent,
            frames_received = snapshot.frames_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            send_failures = snapshot.send_failures,
            framing_errors = snapshot.framing_errors,
            decryption_failures = snapshot.decryption_failures,
            routing_failures = snapshot.routing_failures,
            announcements_sent = snapshot.announcements_sent,
            sessions_accepted = snapshot.sessions_accepted,
            sessions_lost = snapshot.sessions_lost,
            uptime_seconds = snapshot.uptime_seconds,
            "Link metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connect_attempts: u64,
    pub connect_failures: u64,
    pub connections_accepted: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub send_failures: u64,
    pub framing_errors: u64,
    pub decryption_failures: u64,
    pub routing_failures: u64,
    pub announcements_sent: u64,
    pub sessions_accepted: u64,
    pub sessions_lost: u64,
    pub uptime_seconds: u64,
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        debug!(
            operation = self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = Metrics::new();
        metrics.connect_attempt();
        metrics.connect_attempt();
        metrics.connect_failure();
        metrics.frame_sent(100);
        metrics.frame_sent(28);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connect_attempts, 2);
        assert_eq!(snapshot.connect_failures, 1);
        assert_eq!(snapshot.frames_sent, 2);
        assert_eq!(snapshot.bytes_sent, 128);
        assert_eq!(snapshot.frames_received, 0);
    }
}

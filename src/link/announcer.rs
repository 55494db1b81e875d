//! # Bonding Announcer
//!
//! Sends our identity announcement to every bonded peer.
//!
//! One independent task per peer. Each makes a bounded number of connection
//! attempts and checks before every attempt that the peer is still bonded.
//! On success the connection is wrapped in a session which sends the
//! announcement over it. Failures are logged; nothing is retried later.

use crate::core::peer::{BtAddress, PeerIdentity};
use crate::link::LinkContext;
use crate::transport::ChannelHint;
use crate::utils::timeout::with_timeout_error;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

/// Spawn one announcement task per peer
pub fn announce_all(ctx: &LinkContext, peers: Vec<BtAddress>) -> Vec<JoinHandle<bool>> {
    info!(peers = peers.len(), "Announcing identity to bonded peers");
    peers
        .into_iter()
        .map(|address| {
            let ctx = ctx.clone();
            tokio::spawn(async move { announce_to(&ctx, address).await })
        })
        .collect()
}

/// Wait for announcement tasks; a task that panicked counts as not sent
pub async fn join_announcements(handles: Vec<JoinHandle<bool>>) -> Vec<bool> {
    join_all(handles)
        .await
        .into_iter()
        .map(|joined| {
            joined.unwrap_or_else(|e| {
                error!(error = %e, "Announcement task failed");
                false
            })
        })
        .collect()
}

/// Announce our identity to `address`. Returns whether it was sent.
#[instrument(skip_all, fields(peer = %address))]
pub async fn announce_to(ctx: &LinkContext, address: BtAddress) -> bool {
    let policy = &ctx.config.announce;
    let hint = ChannelHint::ServiceLookup(ctx.config.service.uuid);

    for attempt in 1..=policy.attempts {
        if !ctx.radio.is_bonded(&address) {
            info!(attempt, "Peer is no longer bonded, giving up");
            return false;
        }

        ctx.metrics.connect_attempt();
        match with_timeout_error(ctx.radio.connect(&address, hint), ctx.config.session.connect_timeout).await {
            Ok(stream) => {
                info!(attempt, "Connected to bonded peer");
                let session = ctx.session_with_connection(PeerIdentity::from_address(address), stream);
                let sent = session.send(ctx.directory.create_identity_announcement()).await;
                if sent {
                    ctx.metrics.announcement_sent();
                }
                return sent;
            }
            Err(e) => {
                ctx.metrics.connect_failure();
                warn!(attempt, error = %e, "Announcement connect failed");
            }
        }

        if attempt < policy.attempts {
            tokio::time::sleep(policy.retry_backoff).await;
        }
    }

    warn!(attempts = policy.attempts, "Could not reach bonded peer");
    false
}

//! # Listener Loop
//!
//! Accepts inbound connections one at a time while the backend is active.
//!
//! Each iteration checks the radio, opens a listening endpoint under the
//! service record, waits for one connection, closes the endpoint, and runs
//! the acceptor on its own task, waiting for it before the next iteration.
//! A disabled radio clears the active flag and ends the loop.

use crate::core::peer::BtAddress;
use crate::error::Result;
use crate::link::{Acceptor, LinkContext};
use crate::transport::{BoxedStream, ServiceRecord};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// The inbound side of a backend
pub struct ListenerLoop {
    ctx: LinkContext,
    active: Arc<AtomicBool>,
    shutdown: mpsc::Receiver<()>,
}

impl ListenerLoop {
    /// The loop ends when `shutdown` yields or its sender is dropped
    pub fn new(ctx: LinkContext, active: Arc<AtomicBool>, shutdown: mpsc::Receiver<()>) -> Self {
        Self {
            ctx,
            active,
            shutdown,
        }
    }

    /// Run until the backend stops or the radio goes down
    pub async fn run(self) {
        let Self {
            ctx,
            active,
            mut shutdown,
        } = self;

        let acceptor = Arc::new(Acceptor::new(ctx.clone()));
        let service = ServiceRecord::from(&ctx.config.service);
        info!(service = %service.name, uuid = %service.uuid, "Listener started");

        while active.load(Ordering::SeqCst) {
            if !ctx.radio.is_enabled() {
                warn!("Radio disabled, stopping listener");
                active.store(false, Ordering::SeqCst);
                break;
            }

            let accepted = tokio::select! {
                _ = shutdown.recv() => break,
                accepted = accept_one(&ctx, &service) => accepted,
            };

            match accepted {
                Ok((stream, remote)) => {
                    let acceptor = acceptor.clone();
                    let worker = tokio::spawn(async move { acceptor.accept(stream, remote).await });
                    match worker.await {
                        Ok(Ok(())) => debug!(%remote, "Inbound connection handled"),
                        Ok(Err(e)) => warn!(%remote, error = %e, "Inbound connection failed"),
                        Err(e) => error!(%remote, error = %e, "Acceptor task panicked"),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Listening failed");
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = tokio::time::sleep(ctx.config.listener.error_backoff) => {}
                    }
                }
            }
        }

        info!("Listener stopped");
    }
}

/// Open an endpoint, take one connection, close the endpoint
async fn accept_one(ctx: &LinkContext, service: &ServiceRecord) -> Result<(BoxedStream, BtAddress)> {
    let mut endpoint = ctx.radio.listen(service).await?;
    let accepted = endpoint.accept().await;
    drop(endpoint);
    accepted
}

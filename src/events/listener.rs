//! Cross-process event listener
//!
//! Subscribes to `{prefix}.events.*` on NATS and re-dispatches events
//! published by other instances to the local registry. Events carrying this
//! instance's origin are skipped; they were dispatched when published.

use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::dispatch::Registry;
use super::types::DomainEvent;
use crate::nats::NatsClient;
use crate::types::Result;

/// Why a listening session ended
enum SessionEnd {
    Shutdown,
    /// Subscription stream closed by the server or connection
    Closed,
}

/// Shared listener state exposed through channel stats
#[derive(Default)]
pub(crate) struct ListenerState {
    pub(crate) listening: AtomicBool,
    pub(crate) received: AtomicU64,
    pub(crate) skipped_own: AtomicU64,
}

pub(crate) struct Listener {
    pub(crate) nats: NatsClient,
    pub(crate) subject: String,
    pub(crate) instance_id: Uuid,
    pub(crate) registry: Arc<Registry>,
    pub(crate) state: Arc<ListenerState>,
    pub(crate) reconnect_delay: Duration,
    /// 0 = unlimited
    pub(crate) max_reconnect_attempts: u32,
}

impl Listener {
    /// Listen until shutdown or the reconnect budget is exhausted
    pub(crate) async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut reconnect_attempts = 0u32;

        loop {
            match self.listen(&mut shutdown).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Closed) => {
                    warn!(subject = %self.subject, "Event subscription closed");
                    reconnect_attempts = 0;
                }
                Err(e) => {
                    error!(subject = %self.subject, error = %e, "Event listener error");
                    reconnect_attempts += 1;

                    if self.max_reconnect_attempts > 0
                        && reconnect_attempts >= self.max_reconnect_attempts
                    {
                        error!(
                            "Max listener reconnection attempts ({}) reached, stopping listener",
                            self.max_reconnect_attempts
                        );
                        break;
                    }
                }
            }

            info!(
                "Resubscribing in {:?} (attempt {})",
                self.reconnect_delay, reconnect_attempts
            );

            tokio::select! {
                _ = sleep(self.reconnect_delay) => {}
                _ = shutdown.recv() => {
                    info!("Shutdown received during listener reconnect wait");
                    break;
                }
            }
        }

        self.state.listening.store(false, Ordering::SeqCst);
        info!("Event listener stopped");
    }

    async fn listen(&self, shutdown: &mut broadcast::Receiver<()>) -> Result<SessionEnd> {
        let mut subscriber = self.nats.subscribe(&self.subject).await?;
        self.state.listening.store(true, Ordering::SeqCst);
        info!(subject = %self.subject, "Event listener subscribed");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    if let Err(e) = subscriber.unsubscribe().await {
                        debug!(error = %e, "Unsubscribe on shutdown failed");
                    }
                    return Ok(SessionEnd::Shutdown);
                }
                message = subscriber.next() => match message {
                    Some(message) => self.handle(&message.payload),
                    None => {
                        self.state.listening.store(false, Ordering::SeqCst);
                        return Ok(SessionEnd::Closed);
                    }
                }
            }
        }
    }

    fn handle(&self, payload: &[u8]) {
        redispatch(&self.registry, &self.state, self.instance_id, payload);
    }
}

/// Decode an inbound message and hand remote events to local handlers
pub(crate) fn redispatch(
    registry: &Registry,
    state: &ListenerState,
    instance_id: Uuid,
    payload: &[u8],
) {
    match serde_json::from_slice::<DomainEvent>(payload) {
        Ok(event) if event.is_from(instance_id) => {
            state.skipped_own.fetch_add(1, Ordering::Relaxed);
        }
        Ok(event) => {
            state.received.fetch_add(1, Ordering::Relaxed);
            debug!(event = %event.name, origin = %event.origin, "Remote event received");
            registry.dispatch(Arc::new(event), false);
        }
        Err(e) => warn!(error = %e, "Discarding undecodable event message"),
    }
}

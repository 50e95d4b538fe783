//! Local dispatch table
//!
//! Maps event names to ordered subscriptions. Each subscription owns an
//! unbounded FIFO queue drained by its own worker task, so one handler sees
//! events in publish order while different handlers run concurrently. A
//! handler error or panic is caught in the worker and reported back to the
//! publisher; it never reaches sibling handlers.

use dashmap::DashMap;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, warn};

use super::handler::EventHandler;
use super::types::{DomainEvent, SubscriptionId};

/// Outcome of one handler invocation
pub(crate) type HandlerOutcome = std::result::Result<(), String>;

/// An event queued for one subscription
struct Delivery {
    event: Arc<DomainEvent>,
    /// Present when the publisher wants the outcome
    done: Option<oneshot::Sender<HandlerOutcome>>,
}

struct Subscription {
    id: SubscriptionId,
    queue: mpsc::UnboundedSender<Delivery>,
}

/// Count of queued or running deliveries
#[derive(Default)]
struct Pending {
    count: AtomicUsize,
    idle: Notify,
}

impl Pending {
    fn begin(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn finish(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Name-keyed registry of subscriptions
#[derive(Default)]
pub(crate) struct Registry {
    subscriptions: DashMap<String, Vec<Subscription>>,
    next_id: AtomicU64,
    pending: Arc<Pending>,
    failures: Arc<AtomicU64>,
}

impl Registry {
    /// Register a handler and start its worker
    pub(crate) fn subscribe(&self, name: &str, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (queue, rx) = mpsc::unbounded_channel();

        tokio::spawn(run_worker(
            id,
            name.to_string(),
            handler,
            rx,
            self.pending.clone(),
            self.failures.clone(),
        ));

        self.subscriptions
            .entry(name.to_string())
            .or_default()
            .push(Subscription { id, queue });

        debug!(event = name, subscription = %id, "Handler subscribed");
        id
    }

    /// Remove a subscription; its worker drains what is already queued
    pub(crate) fn unsubscribe(&self, name: &str, id: SubscriptionId) -> bool {
        let removed = match self.subscriptions.get_mut(name) {
            Some(mut subs) => {
                let before = subs.len();
                subs.retain(|sub| sub.id != id);
                subs.len() != before
            }
            None => false,
        };
        self.subscriptions.remove_if(name, |_, subs| subs.is_empty());

        if removed {
            debug!(event = name, subscription = %id, "Handler unsubscribed");
        }
        removed
    }

    /// Queue an event to every handler for its name.
    ///
    /// With `track`, returns one outcome receiver per handler.
    pub(crate) fn dispatch(
        &self,
        event: Arc<DomainEvent>,
        track: bool,
    ) -> Vec<(SubscriptionId, oneshot::Receiver<HandlerOutcome>)> {
        let mut outcomes = Vec::new();
        let Some(subs) = self.subscriptions.get(&event.name) else {
            return outcomes;
        };

        for sub in subs.iter() {
            let (done, outcome) = if track {
                let (tx, rx) = oneshot::channel();
                (Some(tx), Some(rx))
            } else {
                (None, None)
            };

            self.pending.begin();
            let delivery = Delivery {
                event: event.clone(),
                done,
            };
            if sub.queue.send(delivery).is_err() {
                // Worker gone; the dropped sender resolves the receiver as failed
                self.pending.finish();
                warn!(event = %event.name, subscription = %sub.id, "Handler queue closed");
            }

            if let Some(rx) = outcome {
                outcomes.push((sub.id, rx));
            }
        }

        outcomes
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscriptions.iter().map(|entry| entry.value().len()).sum()
    }

    pub(crate) fn subscribed_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .subscriptions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    pub(crate) fn handler_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub(crate) async fn wait_idle(&self) {
        self.pending.wait_idle().await
    }
}

async fn run_worker(
    id: SubscriptionId,
    name: String,
    handler: Arc<dyn EventHandler>,
    mut rx: mpsc::UnboundedReceiver<Delivery>,
    pending: Arc<Pending>,
    failures: Arc<AtomicU64>,
) {
    while let Some(delivery) = rx.recv().await {
        let outcome = match AssertUnwindSafe(handler.handle(&delivery.event))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(panic) => Err(format!("handler panicked: {}", panic_message(panic.as_ref()))),
        };

        if let Err(reason) = &outcome {
            failures.fetch_add(1, Ordering::Relaxed);
            warn!(event = %name, subscription = %id, error = %reason, "Event handler failed");
        }
        if let Some(done) = delivery.done {
            let _ = done.send(outcome);
        }
        pending.finish();
    }

    debug!(event = %name, subscription = %id, "Handler worker stopped");
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

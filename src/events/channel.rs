//! Event channel
//!
//! `publish` always dispatches to local handlers first, then forwards the
//! event to `{prefix}.events.{name}` when a NATS connection is configured.
//! The background listener started by `start()` brings events from other
//! instances into the same local handlers.

use bytes::Bytes;
use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::dispatch::{HandlerOutcome, Registry};
use super::handler::EventHandler;
use super::listener::{Listener, ListenerState};
use super::types::{
    DispatchReport, DomainEvent, HandlerFailure, SubscriptionId, LEVEL_UP, USER_ACTIVITY,
};
use crate::config::is_subject_token;
use crate::nats::NatsClient;
use crate::types::Result;

/// Event channel configuration
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Origin stamped on published events
    pub instance_id: Uuid,
    /// First subject token, e.g. `tally` for `tally.events.xp_awarded`
    pub subject_prefix: String,
    /// Delay before the listener resubscribes after an error
    pub reconnect_delay: Duration,
    /// Maximum listener resubscribe attempts (0 = unlimited)
    pub max_reconnect_attempts: u32,
    /// Upper bound for forwarding one event to NATS
    pub forward_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            instance_id: Uuid::new_v4(),
            subject_prefix: "tally".to_string(),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 0,
            forward_timeout: Duration::from_secs(2),
        }
    }
}

/// Channel statistics
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStats {
    pub listening: bool,
    pub subscriber_count: usize,
    pub subscribed_names: Vec<String>,
    pub shared_backend: bool,
    pub published: u64,
    pub remote_received: u64,
    pub forward_failures: u64,
    pub handler_failures: u64,
}

/// Pending handler outcomes of one publish
pub struct PublishReceipt {
    event: String,
    outcomes: Vec<(SubscriptionId, oneshot::Receiver<HandlerOutcome>)>,
}

impl PublishReceipt {
    /// Number of local handlers the event was queued to
    pub fn handler_count(&self) -> usize {
        self.outcomes.len()
    }

    /// Wait for every local handler to finish with this event
    pub async fn settled(self) -> DispatchReport {
        let (ids, receivers): (Vec<_>, Vec<_>) = self.outcomes.into_iter().unzip();
        let results = join_all(receivers).await;

        let mut report = DispatchReport {
            event: self.event,
            ..DispatchReport::default()
        };
        for (subscription, result) in ids.into_iter().zip(results) {
            match result {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(error)) => report.failures.push(HandlerFailure {
                    subscription,
                    error,
                }),
                Err(_) => report.failures.push(HandlerFailure {
                    subscription,
                    error: "handler stopped before completing".to_string(),
                }),
            }
        }
        report
    }
}

/// Publish/subscribe fan-out for domain events
pub struct EventChannel {
    config: ChannelConfig,
    nats: Option<NatsClient>,
    registry: Arc<Registry>,
    listener_state: Arc<ListenerState>,
    listener: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
    published: AtomicU64,
    forward_failures: AtomicU64,
}

impl EventChannel {
    /// Create a channel; without a NATS client delivery is local only
    pub fn new(config: ChannelConfig, nats: Option<NatsClient>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            nats,
            registry: Arc::new(Registry::default()),
            listener_state: Arc::new(ListenerState::default()),
            listener: Mutex::new(None),
            shutdown_tx,
            published: AtomicU64::new(0),
            forward_failures: AtomicU64::new(0),
        }
    }

    /// Channel with no shared backend
    pub fn local(config: ChannelConfig) -> Self {
        Self::new(config, None)
    }

    pub fn instance_id(&self) -> Uuid {
        self.config.instance_id
    }

    fn subject(&self, name: &str) -> String {
        format!("{}.events.{}", self.config.subject_prefix, name)
    }

    /// Publish an event to local handlers and, if configured, to NATS
    pub async fn publish(&self, name: &str, payload: JsonValue) -> PublishReceipt {
        let event = Arc::new(DomainEvent::new(name, payload, self.config.instance_id));
        self.published.fetch_add(1, Ordering::Relaxed);

        let outcomes = self.registry.dispatch(event.clone(), true);
        debug!(event = name, handlers = outcomes.len(), "Event published");

        if let Some(nats) = &self.nats {
            self.forward(nats, &event).await;
        }

        PublishReceipt {
            event: name.to_string(),
            outcomes,
        }
    }

    async fn forward(&self, nats: &NatsClient, event: &DomainEvent) {
        if !is_subject_token(&event.name) {
            self.forward_failures.fetch_add(1, Ordering::Relaxed);
            warn!(event = %event.name, "Event name is not a subject token, delivered locally only");
            return;
        }

        let payload = match serde_json::to_vec(event) {
            Ok(raw) => Bytes::from(raw),
            Err(e) => {
                self.forward_failures.fetch_add(1, Ordering::Relaxed);
                warn!(event = %event.name, error = %e, "Event encode failed, delivered locally only");
                return;
            }
        };

        let subject = self.subject(&event.name);
        let sent = forward_within(self.config.forward_timeout, nats.publish(&subject, payload));
        if let Err(e) = sent.await {
            self.forward_failures.fetch_add(1, Ordering::Relaxed);
            warn!(event = %event.name, error = %e, "Event forward failed, delivered locally only");
        }
    }

    /// Announce a product activity (a drama check, a finished quiz, ...)
    pub async fn emit_user_activity(
        &self,
        user: &str,
        activity: &str,
        product: &str,
        metadata: JsonValue,
    ) -> PublishReceipt {
        let metadata = if metadata.is_null() { json!({}) } else { metadata };
        self.publish(
            USER_ACTIVITY,
            json!({
                "user_id": user,
                "activity": activity,
                "product": product,
                "metadata": metadata,
            }),
        )
        .await
    }

    /// Announce a product level change
    pub async fn emit_level_up(
        &self,
        user: &str,
        product: &str,
        old_level: &str,
        new_level: &str,
    ) -> PublishReceipt {
        self.publish(
            LEVEL_UP,
            json!({
                "user_id": user,
                "product": product,
                "old_level": old_level,
                "new_level": new_level,
            }),
        )
        .await
    }

    /// Register a handler for an event name
    pub fn subscribe(&self, name: &str, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        self.registry.subscribe(name, handler)
    }

    /// Remove a handler; returns false if it was not subscribed under `name`
    pub fn unsubscribe(&self, name: &str, subscription: SubscriptionId) -> bool {
        self.registry.unsubscribe(name, subscription)
    }

    /// Start the cross-process listener. Returns false without a shared backend.
    pub fn start(&self) -> bool {
        let Some(nats) = self.nats.clone() else {
            info!("No shared backend, event channel running local-only");
            return false;
        };

        let mut slot = self.listener.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return true;
        }

        let listener = Listener {
            nats,
            subject: self.subject("*"),
            instance_id: self.config.instance_id,
            registry: self.registry.clone(),
            state: self.listener_state.clone(),
            reconnect_delay: self.config.reconnect_delay,
            max_reconnect_attempts: self.config.max_reconnect_attempts,
        };
        *slot = Some(tokio::spawn(listener.run(self.shutdown_tx.subscribe())));

        info!(subject = %self.subject("*"), "Event listener started");
        true
    }

    /// Stop the listener and wait for it to exit
    pub async fn stop(&self) {
        let handle = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        if let Some(handle) = handle {
            let _ = self.shutdown_tx.send(());
            if let Err(e) = handle.await {
                warn!(error = %e, "Event listener task ended abnormally");
            }
        }
    }

    /// Wait until every queued delivery has been handled
    pub async fn wait_idle(&self) {
        self.registry.wait_idle().await
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            listening: self.listener_state.listening.load(Ordering::SeqCst),
            subscriber_count: self.registry.subscriber_count(),
            subscribed_names: self.registry.subscribed_names(),
            shared_backend: self.nats.is_some(),
            published: self.published.load(Ordering::Relaxed),
            remote_received: self.listener_state.received.load(Ordering::Relaxed),
            forward_failures: self.forward_failures.load(Ordering::Relaxed),
            handler_failures: self.registry.handler_failures(),
        }
    }
}

/// Bound a NATS send; a stalled connection counts as a failed forward
async fn forward_within<F>(limit: Duration, send: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    tokio::time::timeout(limit, send).await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::handler_fn;
    use crate::types::TallyError;
    use tokio::sync::Mutex as AsyncMutex;

    fn recorder() -> (Arc<dyn EventHandler>, Arc<AsyncMutex<Vec<DomainEvent>>>) {
        let seen = Arc::new(AsyncMutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = handler_fn(move |event| {
            let sink = sink.clone();
            async move {
                sink.lock().await.push(event);
                Ok(())
            }
        });
        (handler, seen)
    }

    #[tokio::test]
    async fn test_local_delivery_without_listener() {
        let channel = EventChannel::local(ChannelConfig::default());
        let (handler, seen) = recorder();
        channel.subscribe("xp_awarded", handler);

        assert!(!channel.start());
        let report = channel
            .publish("xp_awarded", json!({"user_id": "u1", "xp_awarded": 10}))
            .await
            .settled()
            .await;

        assert!(report.is_clean());
        assert_eq!(report.delivered, 1);
        let seen = seen.lock().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].origin, channel.instance_id());
        assert_eq!(seen[0].u64_field("xp_awarded"), Some(10));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let channel = EventChannel::local(ChannelConfig::default());
        let receipt = channel.publish("league_promotion", json!({})).await;
        assert_eq!(receipt.handler_count(), 0);
        assert_eq!(receipt.settled().await.attempted(), 0);
    }

    #[tokio::test]
    async fn test_failures_are_aggregated_not_propagated() {
        let channel = EventChannel::local(ChannelConfig::default());
        let (good, seen) = recorder();

        channel.subscribe(
            "streak_update",
            handler_fn(|_| async { Err::<(), _>(TallyError::Handler("rejected".into())) }),
        );
        channel.subscribe(
            "streak_update",
            handler_fn(|event| async move {
                if event.name == "streak_update" {
                    panic!("handler blew up");
                }
                Ok(())
            }),
        );
        channel.subscribe("streak_update", good);

        let report = channel
            .publish("streak_update", json!({"streak_days": 3}))
            .await
            .settled()
            .await;

        assert_eq!(report.delivered, 1);
        assert_eq!(report.failures.len(), 2);
        assert!(report.failures[1].error.contains("handler blew up"));
        assert_eq!(seen.lock().await.len(), 1);
        assert_eq!(channel.stats().handler_failures, 2);

        // A panicked worker keeps serving later events
        let report = channel.publish("streak_update", json!({})).await.settled().await;
        assert_eq!(report.attempted(), 3);
    }

    #[tokio::test]
    async fn test_fifo_per_handler() {
        let channel = EventChannel::local(ChannelConfig::default());
        let (handler, seen) = recorder();
        channel.subscribe("xp_awarded", handler);

        for i in 0..50u64 {
            channel.publish("xp_awarded", json!({"seq": i})).await;
        }
        channel.wait_idle().await;

        let order: Vec<u64> = seen
            .lock()
            .await
            .iter()
            .filter_map(|e| e.u64_field("seq"))
            .collect();
        assert_eq!(order, (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_unsubscribe_and_stats() {
        let channel = EventChannel::local(ChannelConfig::default());
        let (first, first_seen) = recorder();
        let (second, second_seen) = recorder();

        let id = channel.subscribe("achievement_unlocked", first);
        channel.subscribe("achievement_unlocked", second);
        channel.subscribe("xp_awarded", handler_fn(|_| async { Ok(()) }));

        let stats = channel.stats();
        assert_eq!(stats.subscriber_count, 3);
        assert_eq!(stats.subscribed_names, vec!["achievement_unlocked", "xp_awarded"]);
        assert!(!stats.listening);
        assert!(!stats.shared_backend);

        assert!(channel.unsubscribe("achievement_unlocked", id));
        assert!(!channel.unsubscribe("achievement_unlocked", id));
        assert!(!channel.unsubscribe("xp_awarded", id));

        channel
            .publish("achievement_unlocked", json!({}))
            .await
            .settled()
            .await;
        assert_eq!(first_seen.lock().await.len(), 0);
        assert_eq!(second_seen.lock().await.len(), 1);
        assert_eq!(channel.stats().published, 1);
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let channel = EventChannel::local(ChannelConfig::default());
        channel.stop().await;
        assert!(!channel.stats().listening);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_forward_times_out() {
        let limit = Duration::from_millis(250);

        let err = forward_within(limit, std::future::pending()).await.unwrap_err();
        assert!(matches!(err, TallyError::Timeout(_)));
        assert!(forward_within(limit, async { Ok(()) }).await.is_ok());

        let err = forward_within(limit, async { Err::<(), _>(TallyError::Nats("closed".into())) })
            .await
            .unwrap_err();
        assert!(err.is_backend_failure());
    }

    #[tokio::test]
    async fn test_user_activity_and_level_up_payloads() {
        let channel = EventChannel::local(ChannelConfig::default());
        let (activity, seen_activity) = recorder();
        let (level, seen_level) = recorder();
        channel.subscribe(USER_ACTIVITY, activity);
        channel.subscribe(LEVEL_UP, level);

        channel
            .emit_user_activity(
                "u1",
                "drama_check",
                "drama",
                json!({"sentence_id": "s-4", "is_correct": true}),
            )
            .await
            .settled()
            .await;
        channel
            .emit_user_activity("u1", "talk_chat", "talk", JsonValue::Null)
            .await
            .settled()
            .await;
        let report = channel
            .emit_level_up("u1", "test", "beginner", "intermediate")
            .await
            .settled()
            .await;
        assert!(report.is_clean());

        let seen = seen_activity.lock().await;
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].str_field("activity"), Some("drama_check"));
        assert_eq!(seen[0].str_field("product"), Some("drama"));
        assert_eq!(seen[0].payload["metadata"]["is_correct"], json!(true));
        assert_eq!(seen[1].payload["metadata"], json!({}));

        let seen = seen_level.lock().await;
        assert_eq!(seen[0].str_field("new_level"), Some("intermediate"));
        assert_eq!(seen[0].str_field("old_level"), Some("beginner"));
    }
}

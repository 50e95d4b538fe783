//! Service wiring for Tally
//!
//! Builds the four components bottom-up (store, limiter, event channel,
//! gamification engine) and owns their background tasks:
//!
//! - local store expiry sweep
//! - cross-process event listener
//! - weekly ranking reset

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::events::{ChannelStats, EventChannel};
use crate::gamification::{spawn_weekly_reset_task, GamificationEngine};
use crate::limiter::UsageLimiter;
use crate::nats::NatsClient;
use crate::store::{spawn_cleanup_task, KeyValueStore, StoreMode, StoreStatus};

/// Combined health of the engine components
#[derive(Debug, Clone, Serialize)]
pub struct ServicesStatus {
    pub store_mode: &'static str,
    pub store_degraded: bool,
    pub shared_failures: u64,
    pub local_entries: usize,
    pub events: ChannelStats,
}

impl ServicesStatus {
    fn new(store: StoreStatus, events: ChannelStats) -> Self {
        Self {
            store_mode: match store.mode {
                StoreMode::Shared => "shared",
                StoreMode::Fallback => "fallback",
            },
            store_degraded: store.degraded,
            shared_failures: store.shared_failures,
            local_entries: store.local.entries,
            events,
        }
    }
}

/// The assembled engine
pub struct Services {
    pub store: Arc<KeyValueStore>,
    pub limiter: Arc<UsageLimiter>,
    pub events: Arc<EventChannel>,
    pub engine: Arc<GamificationEngine>,
    config: EngineConfig,
    shutdown_tx: broadcast::Sender<()>,
}

impl Services {
    /// Build every component, using NATS when a client is given
    pub async fn build(config: EngineConfig, nats: Option<NatsClient>) -> Self {
        let store = Arc::new(KeyValueStore::connect(nats.as_ref(), config.store.clone()).await);
        Self::assemble(config, store, nats, Arc::new(SystemClock))
    }

    /// Build in fallback mode with an explicit clock
    pub fn local(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let store = Arc::new(KeyValueStore::local(config.store.clone()));
        Self::assemble(config, store, None, clock)
    }

    fn assemble(
        config: EngineConfig,
        store: Arc<KeyValueStore>,
        nats: Option<NatsClient>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let limiter = Arc::new(UsageLimiter::with_clock(
            store.clone(),
            config.limiter.clone(),
            clock.clone(),
        ));
        let events = Arc::new(EventChannel::new(config.events.clone(), nats));
        let engine = GamificationEngine::with_clock(
            store.clone(),
            events.clone(),
            config.gamification.clone(),
            clock,
        );
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            store,
            limiter,
            events,
            engine,
            config,
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start background tasks
    pub fn start(&self, weekly_reset: bool) {
        spawn_cleanup_task(self.store.clone(), self.shutdown_tx.subscribe());
        self.events.start();
        if weekly_reset {
            spawn_weekly_reset_task(self.engine.clone(), self.shutdown_tx.subscribe());
        }
        info!("Background tasks started");
    }

    /// Stop background tasks and drain queued event deliveries
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        self.events.stop().await;
        self.events.wait_idle().await;
        info!("Services stopped");
    }

    pub fn status(&self) -> ServicesStatus {
        ServicesStatus::new(self.store.status(), self.events.stats())
    }
}

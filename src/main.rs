//! Tally daemon
//!
//! Runs the engine's background tasks (store sweep, event listener, weekly
//! ranking reset) until interrupted.

use clap::Parser;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tally::{config::Args, nats::NatsClient, Services};

/// Interval of the periodic health log line
const STATUS_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    // Initialize tracing/logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("tally={},info", args.log_level).into());
    if args.log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }
    let config = args
        .engine_config()
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    info!("======================================");
    info!("  Tally - Usage Governance Engine");
    info!("======================================");
    info!("Node ID: {}", args.node_id);
    info!(
        "NATS: {}",
        args.nats.nats_url.as_deref().unwrap_or("(none, fallback mode)")
    );
    info!("KV bucket: {}", args.kv_bucket);
    info!("Event subjects: {}.events.*", args.subject_prefix);
    for (product, limit) in &config.limiter.product_limits {
        info!("  limit {}: {}/day", product, limit);
    }
    info!("Weekly reset: {}", if args.weekly_reset_enabled { "enabled" } else { "disabled" });
    info!("======================================");

    // Connect to NATS (optional: without it the engine runs in fallback mode)
    let nats = if args.shared_backend_configured() {
        match NatsClient::new(&args.nats, &format!("tally-{}", args.node_id)).await {
            Ok(client) => {
                info!("NATS connected successfully");
                Some(client)
            }
            Err(e) => {
                warn!("NATS connection failed (continuing in fallback mode): {}", e);
                None
            }
        }
    } else {
        None
    };

    let services = Services::build(config, nats).await;
    services.start(args.weekly_reset_enabled);

    let status = services.status();
    info!(
        store_mode = status.store_mode,
        degraded = status.store_degraded,
        listening = status.events.listening,
        "Tally running"
    );

    let mut status_tick = tokio::time::interval(STATUS_INTERVAL);
    status_tick.tick().await;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Failed to listen for shutdown signal: {}", e);
                }
                break;
            }
            _ = status_tick.tick() => {
                let status = services.status();
                info!(
                    store_mode = status.store_mode,
                    degraded = status.store_degraded,
                    shared_failures = status.shared_failures,
                    local_entries = status.local_entries,
                    listening = status.events.listening,
                    published = status.events.published,
                    remote_received = status.events.remote_received,
                    handler_failures = status.events.handler_failures,
                    "Status"
                );
            }
        }
    }

    info!("Shutting down");
    services.shutdown().await;
    Ok(())
}

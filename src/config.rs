//! Configuration for Tally
//!
//! CLI arguments and environment variable handling using clap.
//! Each component keeps its own config struct with sensible defaults;
//! `Args::engine_config()` assembles them for the daemon.

use clap::Parser;
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

use crate::events::ChannelConfig;
use crate::gamification::GamificationConfig;
use crate::limiter::LimiterConfig;
use crate::store::StoreConfig;

/// Default per-product daily limits, as `product=limit` pairs
pub const DEFAULT_PRODUCT_LIMITS: &str = "talk=60,drama=20,test=20,journey=20";

/// Tally - usage governance and gamification engine
#[derive(Parser, Debug, Clone)]
#[command(name = "tally")]
#[command(about = "Daily usage quotas, XP, streaks, leagues and achievements")]
pub struct Args {
    /// Unique identifier for this engine instance (event origin)
    #[arg(long, env = "NODE_ID", default_value_t = Uuid::new_v4())]
    pub node_id: Uuid,

    /// NATS configuration
    #[command(flatten)]
    pub nats: NatsArgs,

    /// JetStream key-value bucket used as the shared store
    #[arg(long, env = "KV_BUCKET", default_value = "tally")]
    pub kv_bucket: String,

    /// Subject prefix for cross-process domain events
    #[arg(long, env = "EVENT_SUBJECT_PREFIX", default_value = "tally")]
    pub subject_prefix: String,

    /// Per-product daily limits, e.g. "talk=60,drama=20"
    #[arg(long, env = "PRODUCT_LIMITS", default_value = DEFAULT_PRODUCT_LIMITS)]
    pub product_limits: String,

    /// Quota counter TTL in seconds
    #[arg(long, env = "COUNTER_TTL_SECS", default_value = "86400")]
    pub counter_ttl_secs: u64,

    /// League ranking cache TTL in seconds
    #[arg(long, env = "RANKING_TTL_SECS", default_value = "3600")]
    pub ranking_ttl_secs: u64,

    /// Timeout for a single shared-store round trip in milliseconds
    #[arg(long, env = "STORE_TIMEOUT_MS", default_value = "2000")]
    pub store_timeout_ms: u64,

    /// Interval of the local fallback store expiry sweep in seconds
    #[arg(long, env = "CLEANUP_INTERVAL_SECS", default_value = "60")]
    pub cleanup_interval_secs: u64,

    /// Delay before the event listener resubscribes after an error
    #[arg(long, env = "LISTENER_RECONNECT_DELAY_MS", default_value = "5000")]
    pub listener_reconnect_delay_ms: u64,

    /// Maximum listener resubscribe attempts (0 = unlimited)
    #[arg(long, env = "LISTENER_MAX_RECONNECTS", default_value = "0")]
    pub listener_max_reconnects: u32,

    /// Upper bound for forwarding one event to NATS in milliseconds
    #[arg(long, env = "EVENT_FORWARD_TIMEOUT_MS", default_value = "2000")]
    pub event_forward_timeout_ms: u64,

    /// Run the weekly XP reset at Monday 00:00 UTC
    #[arg(
        long,
        env = "WEEKLY_RESET_ENABLED",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub weekly_reset_enabled: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format (text or json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: String,
}

/// NATS connection configuration
#[derive(Parser, Debug, Clone)]
pub struct NatsArgs {
    /// NATS server URL; when absent the engine runs in fallback mode
    #[arg(long, env = "NATS_URL")]
    pub nats_url: Option<String>,

    /// NATS username (optional)
    #[arg(long, env = "NATS_USER")]
    pub nats_user: Option<String>,

    /// NATS password (optional)
    #[arg(long, env = "NATS_PASSWORD")]
    pub nats_password: Option<String>,
}

/// Assembled configuration for all engine components
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub store: StoreConfig,
    pub limiter: LimiterConfig,
    pub events: ChannelConfig,
    pub gamification: GamificationConfig,
}

impl Args {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        parse_product_limits(&self.product_limits)?;

        if self.counter_ttl_secs == 0 {
            return Err("COUNTER_TTL_SECS must be greater than zero".to_string());
        }
        if self.ranking_ttl_secs == 0 {
            return Err("RANKING_TTL_SECS must be greater than zero".to_string());
        }
        if self.store_timeout_ms == 0 {
            return Err("STORE_TIMEOUT_MS must be greater than zero".to_string());
        }
        if self.event_forward_timeout_ms == 0 {
            return Err("EVENT_FORWARD_TIMEOUT_MS must be greater than zero".to_string());
        }
        if !matches!(self.log_format.as_str(), "text" | "json") {
            return Err(format!("LOG_FORMAT must be text or json, got {}", self.log_format));
        }
        if !is_subject_token(&self.subject_prefix) {
            return Err(format!(
                "EVENT_SUBJECT_PREFIX must be a single NATS subject token, got {}",
                self.subject_prefix
            ));
        }

        Ok(())
    }

    /// Whether a shared backend is configured
    pub fn shared_backend_configured(&self) -> bool {
        self.nats.nats_url.is_some()
    }

    /// Build the per-component configuration
    pub fn engine_config(&self) -> Result<EngineConfig, String> {
        let product_limits = parse_product_limits(&self.product_limits)?;

        Ok(EngineConfig {
            store: StoreConfig {
                bucket: self.kv_bucket.clone(),
                op_timeout: Duration::from_millis(self.store_timeout_ms),
                cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
            },
            limiter: LimiterConfig {
                counter_ttl: Duration::from_secs(self.counter_ttl_secs),
                product_limits,
            },
            events: ChannelConfig {
                instance_id: self.node_id,
                subject_prefix: self.subject_prefix.clone(),
                reconnect_delay: Duration::from_millis(self.listener_reconnect_delay_ms),
                max_reconnect_attempts: self.listener_max_reconnects,
                forward_timeout: Duration::from_millis(self.event_forward_timeout_ms),
            },
            gamification: GamificationConfig {
                ranking_ttl: Duration::from_secs(self.ranking_ttl_secs),
                ..GamificationConfig::default()
            },
        })
    }
}

/// Parse "product=limit" pairs separated by commas
pub fn parse_product_limits(raw: &str) -> Result<BTreeMap<String, u32>, String> {
    let mut limits = BTreeMap::new();

    for pair in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (product, limit) = pair
            .split_once('=')
            .ok_or_else(|| format!("Invalid product limit '{}', expected product=limit", pair))?;
        let product = product.trim();
        if product.is_empty() {
            return Err(format!("Missing product code in '{}'", pair));
        }
        let limit = limit
            .trim()
            .parse::<u32>()
            .map_err(|e| format!("Invalid limit for {}: {}", product, e))?;
        limits.insert(product.to_string(), limit);
    }

    Ok(limits)
}

/// A NATS subject token: non-empty, no separators or wildcards
pub(crate) fn is_subject_token(s: &str) -> bool {
    !s.is_empty()
        && !s
            .chars()
            .any(|c| c == '.' || c == '*' || c == '>' || c.is_whitespace())
}

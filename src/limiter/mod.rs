//! Usage limiter
//!
//! Per-(user, product, UTC day) quota counters on top of the key-value store.
//! Counter key: `usage:{user}:{product}:{YYYY-MM-DD}`. A counter is created
//! by the first consume of the day and expires `counter_ttl` after creation.
//!
//! Two admission policies are offered:
//!
//! - `check` + `consume`: two round trips, not atomic. Under N concurrent
//!   callers the committed count can exceed the limit by at most N - 1.
//! - `acquire`: increment first, refund when the new value exceeds the limit.
//!   The number of admitted calls never exceeds the limit.
//!
//! Store failures fail open: usage governance degrades to unlimited rather
//! than blocking users while infrastructure is down.

use chrono::{Duration as DateDuration, NaiveDate};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{parse_product_limits, DEFAULT_PRODUCT_LIMITS};
use crate::store::KeyValueStore;

/// Days reported by `usage_history` when callers have no preference
pub const DEFAULT_HISTORY_DAYS: u32 = 7;

/// Limiter configuration
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    /// Lifetime of a daily counter, measured from its creation
    pub counter_ttl: Duration,
    /// Configured daily limit per product code
    pub product_limits: BTreeMap<String, u32>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            counter_ttl: Duration::from_secs(86400),
            product_limits: parse_product_limits(DEFAULT_PRODUCT_LIMITS).unwrap_or_default(),
        }
    }
}

/// Usage count for one day
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyUsage {
    pub date: NaiveDate,
    pub count: u64,
}

/// Counter key for a user, product and day
pub fn usage_key(user: &str, product: &str, date: NaiveDate) -> String {
    format!("usage:{}:{}:{}", user, product, date.format("%Y-%m-%d"))
}

/// Daily quota enforcement
pub struct UsageLimiter {
    store: Arc<KeyValueStore>,
    clock: Arc<dyn Clock>,
    config: LimiterConfig,
}

impl UsageLimiter {
    pub fn new(store: Arc<KeyValueStore>, config: LimiterConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<KeyValueStore>, config: LimiterConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    fn today_key(&self, user: &str, product: &str) -> String {
        usage_key(user, product, self.clock.today())
    }

    /// Whether another use fits under `daily_limit` today
    pub async fn check(&self, user: &str, product: &str, daily_limit: u32) -> bool {
        let key = self.today_key(user, product);
        match self.store.try_get_counter(&key).await {
            Ok(count) => {
                let allowed = count < i64::from(daily_limit);
                debug!(
                    user = user,
                    product = product,
                    count = count,
                    limit = daily_limit,
                    allowed = allowed,
                    "Usage check"
                );
                allowed
            }
            Err(e) => {
                warn!(user = user, product = product, error = %e, "Usage check failed, allowing");
                true
            }
        }
    }

    /// Record one use for today
    pub async fn consume(&self, user: &str, product: &str) {
        let key = self.today_key(user, product);
        match self
            .store
            .try_increment(&key, 1, Some(self.config.counter_ttl))
            .await
        {
            Ok(inc) => debug!(
                user = user,
                product = product,
                count = inc.value,
                first_today = inc.created,
                "Usage consumed"
            ),
            Err(e) => warn!(user = user, product = product, error = %e, "Usage consume failed, skipping"),
        }
    }

    /// Uses left today, never negative
    pub async fn remaining(&self, user: &str, product: &str, daily_limit: u32) -> u64 {
        let key = self.today_key(user, product);
        match self.store.try_get_counter(&key).await {
            Ok(count) => remaining_from(daily_limit, count),
            Err(e) => {
                warn!(user = user, product = product, error = %e, "Usage lookup failed, reporting full limit");
                u64::from(daily_limit)
            }
        }
    }

    /// Clear today's counter; returns whether a counter existed
    pub async fn reset(&self, user: &str, product: &str) -> bool {
        let key = self.today_key(user, product);
        let existed = self.store.delete(&key).await;
        info!(user = user, product = product, existed = existed, "Daily usage reset");
        existed
    }

    /// Admit one use atomically: increment, then refund if over the limit
    pub async fn acquire(&self, user: &str, product: &str, daily_limit: u32) -> bool {
        let key = self.today_key(user, product);
        let inc = match self
            .store
            .try_increment(&key, 1, Some(self.config.counter_ttl))
            .await
        {
            Ok(inc) => inc,
            Err(e) => {
                warn!(user = user, product = product, error = %e, "Usage acquire failed, allowing");
                return true;
            }
        };

        if inc.value <= i64::from(daily_limit) {
            return true;
        }

        if let Err(e) = self.store.try_increment(&key, -1, None).await {
            warn!(user = user, product = product, error = %e, "Usage refund failed");
        }
        debug!(user = user, product = product, limit = daily_limit, "Usage acquire rejected");
        false
    }

    /// Configured daily limit for a product
    pub fn limit_for(&self, product: &str) -> Option<u32> {
        self.config.product_limits.get(product).copied()
    }

    /// `check` against the configured limit; products without one are unlimited
    pub async fn check_product(&self, user: &str, product: &str) -> bool {
        match self.limit_for(product) {
            Some(limit) => self.check(user, product, limit).await,
            None => true,
        }
    }

    /// `remaining` against the configured limit; `None` for unlimited products
    pub async fn remaining_product(&self, user: &str, product: &str) -> Option<u64> {
        match self.limit_for(product) {
            Some(limit) => Some(self.remaining(user, product, limit).await),
            None => None,
        }
    }

    /// Per-day counts for the last `days` days, newest first
    pub async fn usage_history(&self, user: &str, product: &str, days: u32) -> Vec<DailyUsage> {
        let today = self.clock.today();
        let mut history = Vec::with_capacity(days as usize);

        for offset in 0..days {
            let date = today - DateDuration::days(i64::from(offset));
            match self.store.try_get_counter(&usage_key(user, product, date)).await {
                Ok(count) => history.push(DailyUsage {
                    date,
                    count: count.max(0) as u64,
                }),
                Err(e) => {
                    warn!(user = user, product = product, error = %e, "Usage history unavailable");
                    return Vec::new();
                }
            }
        }

        history
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }
}

fn remaining_from(daily_limit: u32, count: i64) -> u64 {
    (i64::from(daily_limit) - count).max(0) as u64
}

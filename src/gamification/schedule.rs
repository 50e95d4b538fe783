//! Weekly ranking reset scheduler
//!
//! Runs `weekly_reset` at every Monday 00:00 UTC, the end of Sunday.

use chrono::{DateTime, Datelike, Duration as DateDuration, NaiveTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::engine::GamificationEngine;

/// First Monday 00:00 UTC strictly after `now`
pub fn next_weekly_reset(now: DateTime<Utc>) -> DateTime<Utc> {
    let days_ahead = 7 - i64::from(now.weekday().num_days_from_monday());
    let monday = now.date_naive() + DateDuration::days(days_ahead);
    monday.and_time(NaiveTime::MIN).and_utc()
}

/// Spawn a background task that resets weekly rankings on schedule
pub fn spawn_weekly_reset_task(
    engine: Arc<GamificationEngine>,
    mut shutdown: broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        loop {
            let now = engine.clock().now();
            let next = next_weekly_reset(now);
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            debug!(next_reset = %next, "Weekly reset scheduled");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.recv() => {
                    debug!("Weekly reset task stopping");
                    break;
                }
            }

            let report = engine.weekly_reset().await;
            info!(
                profiles_reset = report.profiles_reset,
                caches_invalidated = report.caches_invalidated,
                "Scheduled weekly reset completed"
            );
        }
    });
    info!("Weekly reset task started");
}

//! Domain event and dispatch result types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use uuid::Uuid;

/// Published after every streak recompute that changed the streak
pub const STREAK_UPDATE: &str = "streak_update";
/// Published after every new achievement grant
pub const ACHIEVEMENT_UNLOCKED: &str = "achievement_unlocked";
/// Published after every XP award
pub const XP_AWARDED: &str = "xp_awarded";
/// Published when a user's league rises
pub const LEAGUE_PROMOTION: &str = "league_promotion";
/// Published after the weekly XP sweep
pub const WEEKLY_RANKINGS_RESET: &str = "weekly_rankings_reset";
/// Product activity reported by the serving layer
pub const USER_ACTIVITY: &str = "user_activity";
/// Product level change reported by the serving layer
pub const LEVEL_UP: &str = "level_up";

/// A state transition announced on the event channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub name: String,
    pub payload: JsonValue,
    pub timestamp: DateTime<Utc>,
    /// Instance that published the event
    pub origin: Uuid,
}

impl DomainEvent {
    pub fn new(name: impl Into<String>, payload: JsonValue, origin: Uuid) -> Self {
        Self {
            name: name.into(),
            payload,
            timestamp: Utc::now(),
            origin,
        }
    }

    /// Whether this instance published the event
    pub fn is_from(&self, instance: Uuid) -> bool {
        self.origin == instance
    }

    /// String field of an object payload
    pub fn str_field(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(JsonValue::as_str)
    }

    /// Unsigned integer field of an object payload
    pub fn u64_field(&self, field: &str) -> Option<u64> {
        self.payload.get(field).and_then(JsonValue::as_u64)
    }
}

/// Handle for removing a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriptionId(pub(crate) u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A handler that failed or panicked while handling one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    pub subscription: SubscriptionId,
    pub error: String,
}

/// Aggregated outcome of one publish across all local handlers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub event: String,
    /// Handlers that completed successfully
    pub delivered: usize,
    pub failures: Vec<HandlerFailure>,
}

impl DispatchReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Handlers the event was queued to
    pub fn attempted(&self) -> usize {
        self.delivered + self.failures.len()
    }
}

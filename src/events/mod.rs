//! Event channel for Tally
//!
//! Publish/subscribe fan-out of domain events:
//! - Local dispatch table, always available, FIFO per handler
//! - NATS core subjects for cross-process delivery when configured
//! - Structured fan-out: `PublishReceipt::settled()` awaits every handler
//!   and aggregates failures

pub mod channel;
mod dispatch;
pub mod handler;
mod listener;
pub mod types;

pub use channel::{ChannelConfig, ChannelStats, EventChannel, PublishReceipt};
pub use handler::{handler_fn, EventHandler, FnHandler};
pub use types::{
    DispatchReport, DomainEvent, HandlerFailure, SubscriptionId, ACHIEVEMENT_UNLOCKED,
    LEAGUE_PROMOTION, LEVEL_UP, STREAK_UPDATE, USER_ACTIVITY, WEEKLY_RANKINGS_RESET, XP_AWARDED,
};

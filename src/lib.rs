//! Tally - usage governance and gamification engine
//!
//! Tally enforces per-user daily product quotas and keeps each user's
//! motivational state (XP, streak, league, achievements), announcing every
//! transition on a publish/subscribe channel.
//!
//! ## Components
//!
//! - **Store**: TTL key-value store on a NATS JetStream bucket, with an
//!   in-process fallback surfaced as degraded mode
//! - **Limiter**: per-(user, product, day) quota counters, fail-open
//! - **Events**: local dispatch table plus NATS subjects across instances
//! - **Gamification**: XP ledger, streak state machine, leagues,
//!   achievements, cached weekly rankings
//!
//! Store and channel failures never reach callers; they degrade to
//! best-effort in-process behaviour and are logged.

pub mod clock;
pub mod config;
pub mod events;
pub mod gamification;
pub mod limiter;
pub mod nats;
pub mod services;
pub mod store;
pub mod types;

pub use config::{Args, EngineConfig};
pub use services::Services;
pub use types::{Result, TallyError};

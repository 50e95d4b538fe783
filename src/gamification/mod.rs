//! Gamification for Tally
//!
//! - `catalog`: league thresholds, XP action table, achievement catalog
//! - `streak`: pure streak continuity state machine
//! - `profile`: persisted profile document and key layout
//! - `ranking`: league ordering, rank and percentile
//! - `engine`: the stateful engine tying these to the store and event channel
//! - `schedule`: weekly reset timing

pub mod catalog;
pub mod engine;
pub mod profile;
pub mod ranking;
pub mod schedule;
pub mod streak;

pub use catalog::{Achievement, Catalog, League, XpAction};
pub use engine::{
    AchievementGrant, AwardOutcome, GamificationConfig, GamificationEngine, StreakOutcome,
    UserStats, WeeklyResetReport,
};
pub use profile::GamificationProfile;
pub use ranking::{LeaderboardEntry, RankingEntry, RankingSnapshot};
pub use schedule::{next_weekly_reset, spawn_weekly_reset_task};
pub use streak::{StreakState, StreakTransition};

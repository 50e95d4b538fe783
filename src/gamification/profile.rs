//! Gamification profile model and key layout
//!
//! A profile is split across three keys so XP never goes through a
//! read-modify-write:
//!
//! - `gamification:profile:{user}`: JSON document (streak, league, achievements)
//! - `gamification:xp_total:{user}`: atomic counter
//! - `gamification:xp_weekly:{user}`: atomic counter, zeroed weekly

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::catalog::League;
use super::streak::StreakState;

pub const PROFILE_PREFIX: &str = "gamification:profile:";
pub const XP_TOTAL_PREFIX: &str = "gamification:xp_total:";
pub const XP_WEEKLY_PREFIX: &str = "gamification:xp_weekly:";
pub const RANKING_PREFIX: &str = "league_rankings:";

pub fn profile_key(user: &str) -> String {
    format!("{}{}", PROFILE_PREFIX, user)
}

pub fn xp_total_key(user: &str) -> String {
    format!("{}{}", XP_TOTAL_PREFIX, user)
}

pub fn xp_weekly_key(user: &str) -> String {
    format!("{}{}", XP_WEEKLY_PREFIX, user)
}

pub fn ranking_key(league: League) -> String {
    format!("{}{}", RANKING_PREFIX, league)
}

/// Persisted profile document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileDoc {
    #[serde(flatten)]
    pub streak: StreakState,
    #[serde(default)]
    pub current_league: League,
    /// Unlock order preserved, no duplicates
    #[serde(default)]
    pub achievements: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProfileDoc {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            streak: StreakState::default(),
            current_league: League::Bronze,
            achievements: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_achievement(&self, id: &str) -> bool {
        self.achievements.iter().any(|held| held == id)
    }

    /// Append an achievement; returns false if already held
    pub fn grant(&mut self, id: &str) -> bool {
        if self.has_achievement(id) {
            return false;
        }
        self.achievements.push(id.to_string());
        true
    }

    /// Raise the league; never lowers it
    pub fn raise_league(&mut self, league: League) -> Option<League> {
        if league > self.current_league {
            let previous = self.current_league;
            self.current_league = league;
            Some(previous)
        } else {
            None
        }
    }
}

/// A user's motivational state; absent users read as the zero state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GamificationProfile {
    pub user_id: String,
    pub total_xp: u64,
    pub weekly_xp: u64,
    pub streak_days: u32,
    pub longest_streak: u32,
    pub last_activity_date: Option<NaiveDate>,
    pub current_league: League,
    pub achievements: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl GamificationProfile {
    pub fn zero(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            total_xp: 0,
            weekly_xp: 0,
            streak_days: 0,
            longest_streak: 0,
            last_activity_date: None,
            current_league: League::Bronze,
            achievements: Vec::new(),
            created_at: None,
            updated_at: None,
        }
    }

    /// Combine a stored document with the XP counters
    pub fn assemble(user_id: &str, doc: Option<ProfileDoc>, total_xp: u64, weekly_xp: u64) -> Self {
        let mut profile = Self::zero(user_id);
        profile.total_xp = total_xp;
        profile.weekly_xp = weekly_xp;
        profile.current_league = League::for_xp(total_xp);

        if let Some(doc) = doc {
            profile.streak_days = doc.streak.streak_days;
            profile.longest_streak = doc.streak.longest_streak;
            profile.last_activity_date = doc.streak.last_activity_date;
            profile.current_league = profile.current_league.max(doc.current_league);
            profile.achievements = doc.achievements;
            profile.created_at = Some(doc.created_at);
            profile.updated_at = Some(doc.updated_at);
        }
        profile
    }

    /// Whether nothing has been recorded for the user yet
    pub fn is_new(&self) -> bool {
        self.created_at.is_none() && self.total_xp == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(profile_key("u1"), "gamification:profile:u1");
        assert_eq!(xp_total_key("u1"), "gamification:xp_total:u1");
        assert_eq!(xp_weekly_key("u1"), "gamification:xp_weekly:u1");
        assert_eq!(ranking_key(League::Gold), "league_rankings:gold");
    }

    #[test]
    fn test_grant_is_idempotent_and_ordered() {
        let mut doc = ProfileDoc::new(Utc::now());
        assert!(doc.grant("test_ace"));
        assert!(doc.grant("streak_7_days"));
        assert!(!doc.grant("test_ace"));
        assert_eq!(doc.achievements, vec!["test_ace", "streak_7_days"]);
    }

    #[test]
    fn test_league_only_rises() {
        let mut doc = ProfileDoc::new(Utc::now());
        assert_eq!(doc.raise_league(League::Gold), Some(League::Bronze));
        assert_eq!(doc.raise_league(League::Silver), None);
        assert_eq!(doc.current_league, League::Gold);
    }

    #[test]
    fn test_doc_json_is_flat() {
        let mut doc = ProfileDoc::new(Utc::now());
        doc.streak.streak_days = 3;
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["streak_days"], 3);
        assert_eq!(value["current_league"], "bronze");

        let back: ProfileDoc = serde_json::from_value(value).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn test_assemble_zero_state() {
        let profile = GamificationProfile::assemble("u1", None, 0, 0);
        assert_eq!(profile, GamificationProfile::zero("u1"));
        assert!(profile.is_new());

        let profile = GamificationProfile::assemble("u1", None, 1600, 40);
        assert_eq!(profile.current_league, League::Gold);
        assert!(!profile.is_new());
    }
}

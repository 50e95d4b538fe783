//! Static gamification tables: leagues, XP actions, achievements

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::types::TallyError;

// ============================================================================
// Leagues
// ============================================================================

/// League tier, ordered from lowest to highest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum League {
    #[default]
    Bronze,
    Silver,
    Gold,
    Diamond,
}

impl League {
    pub const ALL: [League; 4] = [League::Bronze, League::Silver, League::Gold, League::Diamond];

    /// Inclusive lower XP bound of the tier
    pub fn min_xp(self) -> u64 {
        match self {
            League::Bronze => 0,
            League::Silver => 500,
            League::Gold => 1500,
            League::Diamond => 3000,
        }
    }

    /// Highest tier whose threshold `total_xp` meets
    pub fn for_xp(total_xp: u64) -> League {
        Self::ALL
            .into_iter()
            .rev()
            .find(|league| total_xp >= league.min_xp())
            .unwrap_or_default()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            League::Bronze => "bronze",
            League::Silver => "silver",
            League::Gold => "gold",
            League::Diamond => "diamond",
        }
    }
}

impl fmt::Display for League {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for League {
    type Err = TallyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|league| league.as_str() == s)
            .ok_or_else(|| TallyError::InvalidAction(format!("unknown league: {}", s)))
    }
}

// ============================================================================
// XP actions
// ============================================================================

/// Actions that earn XP
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum XpAction {
    DailyLogin,
    CompleteLesson,
    PerfectScore,
    StreakMilestone,
    LevelUp,
    ChallengeComplete,
    GrammarMastery,
    PronunciationPerfect,
    ShareProgress,
    InviteFriend,
    TalkChatComplete,
    DramaSentenceCorrect,
    TestQuizComplete,
    JourneyReadingComplete,
    WeeklyGoalAchieved,
    MonthlyChampion,
    FirstPerfectWeek,
    ComebackHero,
}

impl XpAction {
    pub const ALL: [XpAction; 18] = [
        XpAction::DailyLogin,
        XpAction::CompleteLesson,
        XpAction::PerfectScore,
        XpAction::StreakMilestone,
        XpAction::LevelUp,
        XpAction::ChallengeComplete,
        XpAction::GrammarMastery,
        XpAction::PronunciationPerfect,
        XpAction::ShareProgress,
        XpAction::InviteFriend,
        XpAction::TalkChatComplete,
        XpAction::DramaSentenceCorrect,
        XpAction::TestQuizComplete,
        XpAction::JourneyReadingComplete,
        XpAction::WeeklyGoalAchieved,
        XpAction::MonthlyChampion,
        XpAction::FirstPerfectWeek,
        XpAction::ComebackHero,
    ];

    /// Standard point value
    pub fn base_points(self) -> u32 {
        match self {
            XpAction::DailyLogin => 5,
            XpAction::CompleteLesson => 10,
            XpAction::PerfectScore => 20,
            XpAction::StreakMilestone => 50,
            XpAction::LevelUp => 100,
            XpAction::ChallengeComplete => 30,
            XpAction::GrammarMastery => 15,
            XpAction::PronunciationPerfect => 25,
            XpAction::ShareProgress => 5,
            XpAction::InviteFriend => 10,
            XpAction::TalkChatComplete => 10,
            XpAction::DramaSentenceCorrect => 10,
            XpAction::TestQuizComplete => 10,
            XpAction::JourneyReadingComplete => 10,
            XpAction::WeeklyGoalAchieved => 50,
            XpAction::MonthlyChampion => 100,
            XpAction::FirstPerfectWeek => 50,
            XpAction::ComebackHero => 20,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            XpAction::DailyLogin => "daily_login",
            XpAction::CompleteLesson => "complete_lesson",
            XpAction::PerfectScore => "perfect_score",
            XpAction::StreakMilestone => "streak_milestone",
            XpAction::LevelUp => "level_up",
            XpAction::ChallengeComplete => "challenge_complete",
            XpAction::GrammarMastery => "grammar_mastery",
            XpAction::PronunciationPerfect => "pronunciation_perfect",
            XpAction::ShareProgress => "share_progress",
            XpAction::InviteFriend => "invite_friend",
            XpAction::TalkChatComplete => "talk_chat_complete",
            XpAction::DramaSentenceCorrect => "drama_sentence_correct",
            XpAction::TestQuizComplete => "test_quiz_complete",
            XpAction::JourneyReadingComplete => "journey_reading_complete",
            XpAction::WeeklyGoalAchieved => "weekly_goal_achieved",
            XpAction::MonthlyChampion => "monthly_champion",
            XpAction::FirstPerfectWeek => "first_perfect_week",
            XpAction::ComebackHero => "comeback_hero",
        }
    }
}

impl AsRef<str> for XpAction {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for XpAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for XpAction {
    type Err = TallyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| TallyError::InvalidAction(format!("unknown XP action: {}", s)))
    }
}

// ============================================================================
// Achievements
// ============================================================================

pub const STREAK_7_DAYS: &str = "streak_7_days";
pub const STREAK_30_DAYS: &str = "streak_30_days";
pub const STREAK_100_DAYS: &str = "streak_100_days";

/// Achievement granted on reaching a streak length, if any
pub fn streak_milestone_achievement(streak_days: u32) -> Option<&'static str> {
    match streak_days {
        7 => Some(STREAK_7_DAYS),
        30 => Some(STREAK_30_DAYS),
        100 => Some(STREAK_100_DAYS),
        _ => None,
    }
}

/// Display data of an achievement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Achievement {
    pub id: String,
    pub name: String,
    pub description: String,
    pub icon: String,
}

impl Achievement {
    fn new(id: &str, name: &str, description: &str, icon: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            icon: icon.to_string(),
        }
    }
}

/// XP table and achievement catalog loaded at startup
#[derive(Debug, Clone)]
pub struct Catalog {
    xp_points: BTreeMap<XpAction, u32>,
    achievements: BTreeMap<String, Achievement>,
}

impl Default for Catalog {
    fn default() -> Self {
        let xp_points = XpAction::ALL
            .into_iter()
            .map(|action| (action, action.base_points()))
            .collect();

        let achievements = [
            Achievement::new(STREAK_7_DAYS, "7-Day Streak", "Studied seven days in a row", "fire_7"),
            Achievement::new(STREAK_30_DAYS, "30-Day Streak", "Studied thirty days in a row", "fire_30"),
            Achievement::new(STREAK_100_DAYS, "100-Day Streak", "Studied one hundred days in a row", "fire_100"),
            Achievement::new("grammar_expert", "Grammar Expert", "Mastered 50 or more grammar points", "grammar"),
            Achievement::new("pronunciation_master", "Pronunciation Master", "Reached 95% pronunciation accuracy", "mic"),
            Achievement::new("vocabulary_hero", "Vocabulary Hero", "Mastered 500 or more words", "book"),
            Achievement::new("social_butterfly", "Social Butterfly", "Invited five or more friends", "butterfly"),
            Achievement::new("test_ace", "Test Ace", "Perfect score on a mock exam", "crown"),
            Achievement::new("consistent_learner", "Consistent Learner", "Met the weekly goal twelve weeks in a row", "calendar"),
        ]
        .into_iter()
        .map(|achievement| (achievement.id.clone(), achievement))
        .collect();

        Self {
            xp_points,
            achievements,
        }
    }
}

impl Catalog {
    /// Points for an action
    pub fn points(&self, action: XpAction) -> u32 {
        self.xp_points
            .get(&action)
            .copied()
            .unwrap_or_else(|| action.base_points())
    }

    /// Override the point value of an action
    pub fn with_points(mut self, action: XpAction, points: u32) -> Self {
        self.xp_points.insert(action, points);
        self
    }

    /// Add or replace an achievement
    pub fn with_achievement(mut self, achievement: Achievement) -> Self {
        self.achievements.insert(achievement.id.clone(), achievement);
        self
    }

    pub fn achievement(&self, id: &str) -> Option<&Achievement> {
        self.achievements.get(id)
    }

    pub fn achievements(&self) -> impl Iterator<Item = &Achievement> {
        self.achievements.values()
    }
}

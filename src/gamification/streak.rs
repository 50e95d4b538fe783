//! Streak continuity state machine
//!
//! Evaluated once per recorded activity against the UTC calendar date:
//!
//! | day diff        | effect                                   |
//! |-----------------|------------------------------------------|
//! | none (first)    | streak = 1, longest = max(longest, 1)    |
//! | <= 0            | unchanged (same day, or clock skew)      |
//! | 1               | streak + 1, longest = max(longest, streak) |
//! | > 1             | streak = 1, longest unchanged            |
//!
//! The last activity date becomes today in every case.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Persisted streak fields of a profile
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreakState {
    #[serde(default)]
    pub streak_days: u32,
    #[serde(default)]
    pub longest_streak: u32,
    #[serde(default)]
    pub last_activity_date: Option<NaiveDate>,
}

/// Which branch an activity took
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreakTransition {
    /// First recorded activity
    Started,
    /// Already active today, or the stored date is ahead of today
    SameDay,
    /// Active yesterday
    Extended,
    /// Gap of more than one day
    Restarted,
}

impl StreakTransition {
    /// Whether the streak was recomputed (anything but a same-day re-entry)
    pub fn recomputed(self) -> bool {
        !matches!(self, StreakTransition::SameDay)
    }
}

impl StreakState {
    /// Apply one activity on `today`
    pub fn advance(&self, today: NaiveDate) -> (StreakState, StreakTransition) {
        let Some(last) = self.last_activity_date else {
            let next = StreakState {
                streak_days: 1,
                longest_streak: self.longest_streak.max(1),
                last_activity_date: Some(today),
            };
            return (next, StreakTransition::Started);
        };

        let day_diff = (today - last).num_days();
        let (streak_days, longest_streak, transition) = match day_diff {
            d if d <= 0 => (self.streak_days, self.longest_streak, StreakTransition::SameDay),
            1 => {
                let streak = self.streak_days.saturating_add(1);
                (streak, self.longest_streak.max(streak), StreakTransition::Extended)
            }
            _ => (1, self.longest_streak.max(1), StreakTransition::Restarted),
        };

        let next = StreakState {
            streak_days,
            longest_streak,
            last_activity_date: Some(today),
        };
        (next, transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn state(streak: u32, longest: u32, last: NaiveDate) -> StreakState {
        StreakState {
            streak_days: streak,
            longest_streak: longest,
            last_activity_date: Some(last),
        }
    }

    #[test]
    fn test_first_activity_starts_streak() {
        let (next, transition) = StreakState::default().advance(day(10));
        assert_eq!(transition, StreakTransition::Started);
        assert_eq!(next, state(1, 1, day(10)));
    }

    #[test]
    fn test_same_day_is_idempotent() {
        let current = state(4, 9, day(10));
        let (next, transition) = current.advance(day(10));
        assert_eq!(transition, StreakTransition::SameDay);
        assert_eq!(next, current);
        assert!(!transition.recomputed());
    }

    #[test]
    fn test_consecutive_day_extends() {
        let (next, transition) = state(4, 4, day(10)).advance(day(11));
        assert_eq!(transition, StreakTransition::Extended);
        assert_eq!(next, state(5, 5, day(11)));

        let (next, _) = state(2, 9, day(10)).advance(day(11));
        assert_eq!(next, state(3, 9, day(11)));
    }

    #[test]
    fn test_gap_restarts_but_keeps_longest() {
        let (next, transition) = state(6, 6, day(10)).advance(day(12));
        assert_eq!(transition, StreakTransition::Restarted);
        assert_eq!(next, state(1, 6, day(12)));
    }

    #[test]
    fn test_clock_skew_treated_as_same_day() {
        let (next, transition) = state(3, 5, day(12)).advance(day(11));
        assert_eq!(transition, StreakTransition::SameDay);
        assert_eq!(next, state(3, 5, day(11)));
    }

    #[test]
    fn test_longest_never_decreases_over_sequence() {
        let gaps = [1, 1, 0, 3, 1, 1, 1, 1, 0, 2, 1, 5, 1];
        let mut current = StreakState::default();
        let mut today = day(1);
        let mut longest_seen = 0;

        for gap in gaps {
            today += chrono::Duration::days(gap);
            let (next, transition) = current.advance(today);
            match gap {
                0 => assert_eq!(next.streak_days, current.streak_days),
                1 if current.last_activity_date.is_some() => {
                    assert_eq!(next.streak_days, current.streak_days + 1)
                }
                _ if transition == StreakTransition::Restarted => assert_eq!(next.streak_days, 1),
                _ => {}
            }
            assert!(next.longest_streak >= longest_seen);
            longest_seen = next.longest_streak;
            current = next;
        }
        assert_eq!(longest_seen, 5);
    }
}

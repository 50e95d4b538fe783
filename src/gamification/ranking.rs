//! Weekly league rankings

use serde::{Deserialize, Serialize};

use super::catalog::League;

/// One row of a cached league ordering
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankingEntry {
    pub user_id: String,
    pub weekly_xp: u64,
}

/// A user's position in their league
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RankingSnapshot {
    pub user_id: String,
    pub league: League,
    /// 1-indexed; users missing from the ordering rank `total_in_league + 1`
    pub rank: u64,
    pub total_in_league: u64,
    /// 0..=100, 0 for an empty league
    pub percentile: u8,
    pub weekly_xp: u64,
}

/// Leaderboard row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaderboardEntry {
    pub rank: u64,
    pub user_id: String,
    pub weekly_xp: u64,
}

/// Order by weekly XP descending, ties by user id
pub fn sort_ranking(entries: &mut [RankingEntry]) {
    entries.sort_by(|a, b| {
        b.weekly_xp
            .cmp(&a.weekly_xp)
            .then_with(|| a.user_id.cmp(&b.user_id))
    });
}

/// 1-indexed rank of `user`, or population + 1 when absent
pub fn rank_of(ranking: &[RankingEntry], user: &str) -> u64 {
    ranking
        .iter()
        .position(|entry| entry.user_id == user)
        .unwrap_or(ranking.len()) as u64
        + 1
}

/// round((total - rank) / total * 100), clamped to 0..=100
pub fn percentile(rank: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = ((total as f64 - rank as f64) / total as f64 * 100.0).round();
    pct.clamp(0.0, 100.0) as u8
}

//! Gamification engine
//!
//! XP ledger, streak state machine, league classifier, achievement tracker
//! and cached league rankings. Transitions are announced on the event
//! channel. The engine subscribes to its own `streak_update` to grant
//! milestone achievements; that handler never publishes `streak_update`.
//!
//! Profile documents for one user are serialised by a per-user lock within
//! the process. Across processes they are read-modify-write without retry,
//! so concurrent streak or achievement updates for the same user on two
//! instances can lose one write. XP never can: it lives in atomic counters.

use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use super::catalog::{streak_milestone_achievement, Achievement, Catalog, League, XpAction};
use super::profile::{
    profile_key, ranking_key, xp_total_key, xp_weekly_key, GamificationProfile, ProfileDoc,
    PROFILE_PREFIX, XP_WEEKLY_PREFIX,
};
use super::ranking::{
    percentile, rank_of, sort_ranking, LeaderboardEntry, RankingEntry, RankingSnapshot,
};
use super::streak::StreakTransition;
use crate::clock::{Clock, SystemClock};
use crate::events::{
    DomainEvent, EventChannel, EventHandler, SubscriptionId, ACHIEVEMENT_UNLOCKED,
    LEAGUE_PROMOTION, STREAK_UPDATE, WEEKLY_RANKINGS_RESET, XP_AWARDED,
};
use crate::store::KeyValueStore;
use crate::types::{Result, TallyError};

/// Engine configuration
#[derive(Debug, Clone)]
pub struct GamificationConfig {
    /// Lifetime of a cached league ranking
    pub ranking_ttl: Duration,
    pub catalog: Catalog,
}

impl Default for GamificationConfig {
    fn default() -> Self {
        Self {
            ranking_ttl: Duration::from_secs(3600),
            catalog: Catalog::default(),
        }
    }
}

/// Result of `record_activity`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreakOutcome {
    pub streak_days: u32,
    pub longest_streak: u32,
    pub last_activity_date: NaiveDate,
    pub transition: StreakTransition,
    /// Achievement this activity qualified for, if it hit a milestone
    pub milestone: Option<String>,
}

/// Result of `award`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AwardOutcome {
    pub action: XpAction,
    pub xp_awarded: u64,
    pub total_xp: u64,
    pub weekly_xp: u64,
    pub league: League,
    pub previous_league: League,
    pub promoted: bool,
}

/// Result of `award_achievement`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AchievementGrant {
    pub already_held: bool,
    pub achievement: Achievement,
}

/// Result of `weekly_reset`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WeeklyResetReport {
    pub profiles_reset: usize,
    pub caches_invalidated: usize,
    pub reset_at: DateTime<Utc>,
}

/// Profile, ranking and achievement details for one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserStats {
    pub profile: GamificationProfile,
    pub ranking: RankingSnapshot,
    pub achievements: Vec<Achievement>,
}

/// XP, streaks, leagues and achievements
pub struct GamificationEngine {
    store: Arc<KeyValueStore>,
    events: Arc<EventChannel>,
    clock: Arc<dyn Clock>,
    config: GamificationConfig,
    user_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl GamificationEngine {
    /// Create the engine and subscribe its milestone handler
    pub fn new(
        store: Arc<KeyValueStore>,
        events: Arc<EventChannel>,
        config: GamificationConfig,
    ) -> Arc<Self> {
        Self::with_clock(store, events, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<KeyValueStore>,
        events: Arc<EventChannel>,
        config: GamificationConfig,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let engine = Arc::new(Self {
            store,
            events,
            clock,
            config,
            user_locks: DashMap::new(),
        });
        engine.subscribe_milestones();
        engine
    }

    fn subscribe_milestones(self: &Arc<Self>) -> SubscriptionId {
        let handler = MilestoneHandler {
            engine: Arc::downgrade(self),
        };
        self.events.subscribe(STREAK_UPDATE, Arc::new(handler))
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn catalog(&self) -> &Catalog {
        &self.config.catalog
    }

    /// Serialise profile mutations for one user within this process
    async fn lock_user<'a>(&'a self, user: &'a str) -> UserGuard<'a> {
        let lock = self
            .user_locks
            .entry(user.to_string())
            .or_default()
            .clone();
        UserGuard {
            locks: &self.user_locks,
            user,
            guard: Some(lock.lock_owned().await),
        }
    }

    async fn load_doc(&self, user: &str) -> Option<ProfileDoc> {
        match self.store.get_json::<ProfileDoc>(&profile_key(user)).await {
            Ok(doc) => doc,
            Err(e) => {
                error!(user = user, error = %e, "Unreadable profile document, starting from zero state");
                None
            }
        }
    }

    async fn save_doc(&self, user: &str, doc: &mut ProfileDoc) {
        doc.updated_at = self.clock.now();
        match self.store.set_json(&profile_key(user), doc, None).await {
            Ok(true) => {}
            Ok(false) => warn!(user = user, "Profile document not persisted"),
            Err(e) => warn!(user = user, error = %e, "Profile document not encoded"),
        }
    }

    async fn counter(&self, key: &str) -> u64 {
        match self.store.get_counter(key).await {
            Ok(value) => value.max(0) as u64,
            Err(e) => {
                warn!(key = key, error = %e, "Unreadable XP counter, reading as zero");
                0
            }
        }
    }

    // ========================================================================
    // Streaks
    // ========================================================================

    /// Record a day of activity for `user`
    pub async fn record_activity(&self, user: &str) -> StreakOutcome {
        let today = self.clock.today();

        let (state, transition) = {
            let _guard = self.lock_user(user).await;

            let mut doc = match self.load_doc(user).await {
                Some(doc) => doc,
                None => ProfileDoc::new(self.clock.now()),
            };
            let (next, transition) = doc.streak.advance(today);
            if next != doc.streak {
                doc.streak = next.clone();
                self.save_doc(user, &mut doc).await;
            }
            (next, transition)
        };

        let milestone = match transition {
            StreakTransition::Extended => streak_milestone_achievement(state.streak_days),
            _ => None,
        };

        if milestone.is_some() {
            self.award(user, XpAction::StreakMilestone, 1.0).await;
        }

        if transition.recomputed() {
            self.events
                .publish(
                    STREAK_UPDATE,
                    json!({
                        "user_id": user,
                        "streak_days": state.streak_days,
                        "longest_streak": state.longest_streak,
                        "milestone": milestone,
                    }),
                )
                .await;
        }

        debug!(
            user = user,
            streak_days = state.streak_days,
            transition = ?transition,
            "Activity recorded"
        );

        StreakOutcome {
            streak_days: state.streak_days,
            longest_streak: state.longest_streak,
            last_activity_date: today,
            transition,
            milestone: milestone.map(str::to_string),
        }
    }

    // ========================================================================
    // XP and leagues
    // ========================================================================

    /// Award XP for an action. `None` when the award is invalid.
    pub async fn award(&self, user: &str, action: XpAction, multiplier: f64) -> Option<AwardOutcome> {
        if !multiplier.is_finite() || multiplier < 0.0 {
            let err = TallyError::InvalidAction(format!("bad multiplier {} for {}", multiplier, action));
            warn!(user = user, error = %err, "XP award rejected");
            return None;
        }

        let base = self.config.catalog.points(action);
        let xp = (f64::from(base) * multiplier).round().min(i64::MAX as f64) as i64;

        match self.apply_award(user, action, xp).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!(user = user, action = %action, error = %e, "XP award failed");
                None
            }
        }
    }

    /// Award XP for an action named by string
    pub async fn award_named(&self, user: &str, action: &str, multiplier: f64) -> Option<AwardOutcome> {
        match action.parse::<XpAction>() {
            Ok(action) => self.award(user, action, multiplier).await,
            Err(e) => {
                warn!(user = user, error = %e, "XP award rejected");
                None
            }
        }
    }

    async fn apply_award(&self, user: &str, action: XpAction, xp: i64) -> Result<AwardOutcome> {
        let (total, weekly, doc, previous_league, promotion) = {
            let _guard = self.lock_user(user).await;

            let total = self.store.increment(&xp_total_key(user), xp).await?.value.max(0) as u64;
            let weekly = self.store.increment(&xp_weekly_key(user), xp).await?.value.max(0) as u64;

            let (mut doc, created) = match self.load_doc(user).await {
                Some(doc) => (doc, false),
                None => (ProfileDoc::new(self.clock.now()), true),
            };
            let previous_league = doc.current_league;
            let promotion = doc.raise_league(League::for_xp(total));
            if created || promotion.is_some() {
                self.save_doc(user, &mut doc).await;
            }
            (total, weekly, doc, previous_league, promotion)
        };

        self.events
            .publish(
                XP_AWARDED,
                json!({
                    "user_id": user,
                    "action": action,
                    "xp_awarded": xp,
                    "total_xp": total,
                }),
            )
            .await;

        if let Some(old_league) = promotion {
            info!(user = user, from = %old_league, to = %doc.current_league, "League promotion");
            self.events
                .publish(
                    LEAGUE_PROMOTION,
                    json!({
                        "user_id": user,
                        "old_league": old_league,
                        "new_league": doc.current_league,
                    }),
                )
                .await;
        }

        Ok(AwardOutcome {
            action,
            xp_awarded: xp.max(0) as u64,
            total_xp: total,
            weekly_xp: weekly,
            league: doc.current_league,
            previous_league,
            promoted: promotion.is_some(),
        })
    }

    // ========================================================================
    // Achievements
    // ========================================================================

    /// Grant an achievement once. `None` for unknown achievement ids.
    pub async fn award_achievement(&self, user: &str, achievement_id: &str) -> Option<AchievementGrant> {
        let Some(achievement) = self.config.catalog.achievement(achievement_id).cloned() else {
            let err = TallyError::InvalidAction(format!("unknown achievement: {}", achievement_id));
            warn!(user = user, error = %err, "Achievement award rejected");
            return None;
        };

        {
            let _guard = self.lock_user(user).await;

            let mut doc = match self.load_doc(user).await {
                Some(doc) => doc,
                None => ProfileDoc::new(self.clock.now()),
            };
            if !doc.grant(achievement_id) {
                return Some(AchievementGrant {
                    already_held: true,
                    achievement,
                });
            }
            self.save_doc(user, &mut doc).await;
        }

        info!(user = user, achievement = achievement_id, "Achievement unlocked");
        self.events
            .publish(
                ACHIEVEMENT_UNLOCKED,
                json!({
                    "user_id": user,
                    "achievement_id": achievement.id,
                    "achievement_name": achievement.name,
                }),
            )
            .await;

        Some(AchievementGrant {
            already_held: false,
            achievement,
        })
    }

    // ========================================================================
    // Profiles and rankings
    // ========================================================================

    /// Current profile; absent users read as the zero state
    pub async fn get_profile(&self, user: &str) -> GamificationProfile {
        let doc = self.load_doc(user).await;
        let total = self.counter(&xp_total_key(user)).await;
        let weekly = self.counter(&xp_weekly_key(user)).await;
        GamificationProfile::assemble(user, doc, total, weekly)
    }

    /// Weekly ordering of a league, from cache or recomputed
    pub async fn league_ranking(&self, league: League) -> Vec<RankingEntry> {
        let key = ranking_key(league);
        match self.store.get_json::<Vec<RankingEntry>>(&key).await {
            Ok(Some(cached)) => return cached,
            Ok(None) => {}
            Err(e) => warn!(league = %league, error = %e, "Discarding unreadable ranking cache"),
        }

        let ranking = self.compute_ranking(league).await;
        if let Err(e) = self
            .store
            .set_json(&key, &ranking, Some(self.config.ranking_ttl))
            .await
        {
            warn!(league = %league, error = %e, "Ranking not cached");
        }
        ranking
    }

    async fn compute_ranking(&self, league: League) -> Vec<RankingEntry> {
        let keys = match self.store.scan(&format!("{}*", PROFILE_PREFIX)).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(league = %league, error = %e, "Profile scan failed, empty ranking");
                return Vec::new();
            }
        };

        let mut ranking = Vec::new();
        for key in keys {
            let Some(user) = key.strip_prefix(PROFILE_PREFIX) else {
                continue;
            };
            let Some(doc) = self.load_doc(user).await else {
                continue;
            };
            if doc.current_league != league {
                continue;
            }
            ranking.push(RankingEntry {
                user_id: user.to_string(),
                weekly_xp: self.counter(&xp_weekly_key(user)).await,
            });
        }

        sort_ranking(&mut ranking);
        debug!(league = %league, population = ranking.len(), "League ranking computed");
        ranking
    }

    /// Position of a user within their league
    pub async fn get_ranking(&self, user: &str) -> RankingSnapshot {
        let profile = self.get_profile(user).await;
        self.ranking_for(&profile).await
    }

    async fn ranking_for(&self, profile: &GamificationProfile) -> RankingSnapshot {
        let ranking = self.league_ranking(profile.current_league).await;
        let total = ranking.len() as u64;
        let rank = rank_of(&ranking, &profile.user_id);

        RankingSnapshot {
            user_id: profile.user_id.clone(),
            league: profile.current_league,
            rank,
            total_in_league: total,
            percentile: percentile(rank, total),
            weekly_xp: profile.weekly_xp,
        }
    }

    /// Top `limit` users of a league this week
    pub async fn leaderboard(&self, league: League, limit: usize) -> Vec<LeaderboardEntry> {
        self.league_ranking(league)
            .await
            .into_iter()
            .take(limit)
            .enumerate()
            .map(|(idx, entry)| LeaderboardEntry {
                rank: idx as u64 + 1,
                user_id: entry.user_id,
                weekly_xp: entry.weekly_xp,
            })
            .collect()
    }

    /// Profile, ranking and achievement details
    pub async fn user_stats(&self, user: &str) -> UserStats {
        let profile = self.get_profile(user).await;
        let ranking = self.ranking_for(&profile).await;
        let achievements = profile
            .achievements
            .iter()
            .filter_map(|id| self.config.catalog.achievement(id).cloned())
            .collect();

        UserStats {
            profile,
            ranking,
            achievements,
        }
    }

    // ========================================================================
    // Weekly reset
    // ========================================================================

    /// Zero every weekly XP counter and drop every cached ranking
    pub async fn weekly_reset(&self) -> WeeklyResetReport {
        let keys = match self.store.scan(&format!("{}*", XP_WEEKLY_PREFIX)).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Weekly XP scan failed");
                Default::default()
            }
        };

        let mut profiles_reset = 0;
        for key in keys {
            // Subtract what was read so awards landing mid-reset are kept
            match self.store.try_get_counter(&key).await {
                Ok(0) => {}
                Ok(current) => match self.store.try_increment(&key, -current, None).await {
                    Ok(_) => profiles_reset += 1,
                    Err(e) => warn!(key = %key, error = %e, "Weekly XP not reset, skipping"),
                },
                Err(e) => warn!(key = %key, error = %e, "Weekly XP not reset"),
            }
        }

        let mut caches_invalidated = 0;
        for league in League::ALL {
            if self.store.delete(&ranking_key(league)).await {
                caches_invalidated += 1;
            }
        }

        let reset_at = self.clock.now();
        info!(
            profiles_reset = profiles_reset,
            caches_invalidated = caches_invalidated,
            "Weekly rankings reset"
        );
        self.events
            .publish(
                WEEKLY_RANKINGS_RESET,
                json!({
                    "timestamp": reset_at,
                    "profiles_reset": profiles_reset,
                }),
            )
            .await;

        WeeklyResetReport {
            profiles_reset,
            caches_invalidated,
            reset_at,
        }
    }
}

/// Per-user lock held while a profile is mutated. The map entry is
/// dropped with the last holder.
struct UserGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    user: &'a str,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for UserGuard<'_> {
    fn drop(&mut self) {
        // Release the mutex (and its Arc) before checking for other holders
        self.guard.take();
        self.locks
            .remove_if(self.user, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Grants streak milestone achievements announced by this instance
struct MilestoneHandler {
    engine: Weak<GamificationEngine>,
}

#[async_trait::async_trait]
impl EventHandler for MilestoneHandler {
    async fn handle(&self, event: &DomainEvent) -> Result<()> {
        let Some(engine) = self.engine.upgrade() else {
            return Ok(());
        };
        // The publishing instance's engine grants for its own events
        if !event.is_from(engine.events.instance_id()) {
            return Ok(());
        }

        let user = event
            .str_field("user_id")
            .ok_or_else(|| TallyError::Handler("streak_update without user_id".into()))?;
        let streak_days = event
            .u64_field("streak_days")
            .ok_or_else(|| TallyError::Handler("streak_update without streak_days".into()))?;

        let Some(achievement) = u32::try_from(streak_days)
            .ok()
            .and_then(streak_milestone_achievement)
        else {
            return Ok(());
        };

        engine.award_achievement(user, achievement).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::{handler_fn, ChannelConfig};
    use crate::store::{Increment, KvBackend, LocalBackend, StoreConfig};
    use bytes::Bytes;
    use glob::Pattern;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    /// Shared backend whose increments can be switched off
    #[derive(Default)]
    struct IncrementOutage {
        inner: LocalBackend,
        failing: AtomicBool,
    }

    #[async_trait::async_trait]
    impl KvBackend for IncrementOutage {
        fn name(&self) -> &'static str {
            "increment-outage"
        }
        async fn get(&self, key: &str) -> Result<Option<Bytes>> {
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
            self.inner.set(key, value, ttl).await
        }
        async fn delete(&self, key: &str) -> Result<bool> {
            self.inner.delete(key).await
        }
        async fn increment(&self, key: &str, amount: i64, ttl: Option<Duration>) -> Result<Increment> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(TallyError::Nats("connection reset".into()));
            }
            self.inner.increment(key, amount, ttl).await
        }
        async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
            self.inner.expire(key, ttl).await
        }
        async fn scan(&self, pattern: &Pattern) -> Result<BTreeSet<String>> {
            self.inner.scan(pattern).await
        }
    }

    struct Fixture {
        engine: Arc<GamificationEngine>,
        events: Arc<EventChannel>,
        store: Arc<KeyValueStore>,
        clock: Arc<ManualClock>,
        seen: Arc<AsyncMutex<Vec<DomainEvent>>>,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(KeyValueStore::local(StoreConfig::default()));
            let events = Arc::new(EventChannel::local(ChannelConfig::default()));
            let clock = Arc::new(ManualClock::at_date(
                NaiveDate::from_ymd_opt(2024, 4, 1).unwrap(),
            ));
            let engine = GamificationEngine::with_clock(
                store.clone(),
                events.clone(),
                GamificationConfig::default(),
                clock.clone(),
            );

            let seen = Arc::new(AsyncMutex::new(Vec::new()));
            for name in [
                STREAK_UPDATE,
                ACHIEVEMENT_UNLOCKED,
                XP_AWARDED,
                LEAGUE_PROMOTION,
                WEEKLY_RANKINGS_RESET,
            ] {
                let sink = seen.clone();
                events.subscribe(
                    name,
                    handler_fn(move |event| {
                        let sink = sink.clone();
                        async move {
                            sink.lock().await.push(event);
                            Ok(())
                        }
                    }),
                );
            }

            Self {
                engine,
                events,
                store,
                clock,
                seen,
            }
        }

        async fn count(&self, name: &str) -> usize {
            self.events.wait_idle().await;
            self.seen
                .lock()
                .await
                .iter()
                .filter(|event| event.name == name)
                .count()
        }

        async fn seed_xp(&self, user: &str, total: i64) {
            self.store.increment(&xp_total_key(user), total).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_streak_gaps() {
        let fx = Fixture::new();

        let first = fx.engine.record_activity("u1").await;
        assert_eq!(first.transition, StreakTransition::Started);
        assert_eq!((first.streak_days, first.longest_streak), (1, 1));

        let again = fx.engine.record_activity("u1").await;
        assert_eq!(again.transition, StreakTransition::SameDay);
        assert_eq!(again.streak_days, 1);

        fx.clock.advance_days(1);
        assert_eq!(fx.engine.record_activity("u1").await.streak_days, 2);

        fx.clock.advance_days(3);
        let restarted = fx.engine.record_activity("u1").await;
        assert_eq!(restarted.transition, StreakTransition::Restarted);
        assert_eq!((restarted.streak_days, restarted.longest_streak), (1, 2));

        let profile = fx.engine.get_profile("u1").await;
        assert_eq!(profile.streak_days, 1);
        assert_eq!(profile.longest_streak, 2);
        assert_eq!(profile.last_activity_date, Some(fx.clock.today()));

        // One per recompute, none for the same-day re-entry
        assert_eq!(fx.count(STREAK_UPDATE).await, 3);
    }

    #[tokio::test]
    async fn test_seven_day_streak_grants_achievement_once() {
        let fx = Fixture::new();

        for day in 0..7 {
            if day > 0 {
                fx.clock.advance_days(1);
            }
            fx.engine.record_activity("u1").await;
        }
        fx.events.wait_idle().await;

        let outcome = fx.engine.record_activity("u1").await;
        assert_eq!(outcome.streak_days, 7);

        let profile = fx.engine.get_profile("u1").await;
        assert_eq!(profile.achievements, vec!["streak_7_days"]);
        assert_eq!(profile.total_xp, 50);
        assert_eq!(fx.count(ACHIEVEMENT_UNLOCKED).await, 1);

        let seen = fx.seen.lock().await;
        let milestone_updates = seen
            .iter()
            .filter(|e| e.name == STREAK_UPDATE && e.u64_field("streak_days") == Some(7))
            .count();
        assert_eq!(milestone_updates, 1);
    }

    #[tokio::test]
    async fn test_milestone_handler_ignores_remote_events() {
        let fx = Fixture::new();
        let remote = DomainEvent::new(
            STREAK_UPDATE,
            json!({"user_id": "u9", "streak_days": 7}),
            uuid::Uuid::new_v4(),
        );
        let handler = MilestoneHandler {
            engine: Arc::downgrade(&fx.engine),
        };
        handler.handle(&remote).await.unwrap();
        assert!(fx.engine.get_profile("u9").await.achievements.is_empty());

        let local = DomainEvent {
            origin: fx.events.instance_id(),
            ..remote
        };
        handler.handle(&local).await.unwrap();
        assert_eq!(fx.engine.get_profile("u9").await.achievements, vec!["streak_7_days"]);
    }

    #[tokio::test]
    async fn test_award_promotes_once() {
        let fx = Fixture::new();
        fx.seed_xp("u1", 480).await;

        let outcome = fx
            .engine
            .award("u1", XpAction::ChallengeComplete, 4.0 / 3.0)
            .await
            .unwrap();
        assert_eq!(outcome.xp_awarded, 40);
        assert_eq!(outcome.total_xp, 520);
        assert_eq!(outcome.weekly_xp, 40);
        assert_eq!(outcome.previous_league, League::Bronze);
        assert_eq!(outcome.league, League::Silver);
        assert!(outcome.promoted);

        let again = fx.engine.award("u1", XpAction::DailyLogin, 1.0).await.unwrap();
        assert!(!again.promoted);
        assert_eq!(again.league, League::Silver);

        assert_eq!(fx.count(LEAGUE_PROMOTION).await, 1);
        assert_eq!(fx.count(XP_AWARDED).await, 2);
        let seen = fx.seen.lock().await;
        let promotion = seen.iter().find(|e| e.name == LEAGUE_PROMOTION).unwrap();
        assert_eq!(promotion.str_field("new_league"), Some("silver"));
        assert_eq!(promotion.str_field("old_league"), Some("bronze"));
    }

    #[tokio::test]
    async fn test_award_rounds_and_rejects_bad_input() {
        let fx = Fixture::new();

        let outcome = fx.engine.award("u1", XpAction::DailyLogin, 1.5).await.unwrap();
        assert_eq!(outcome.xp_awarded, 8);

        assert!(fx.engine.award("u1", XpAction::DailyLogin, -1.0).await.is_none());
        assert!(fx.engine.award("u1", XpAction::DailyLogin, f64::NAN).await.is_none());
        assert!(fx.engine.award_named("u1", "teleport", 1.0).await.is_none());
        assert_eq!(
            fx.engine.award_named("u1", "complete_lesson", 1.0).await.unwrap().total_xp,
            18
        );
    }

    #[tokio::test]
    async fn test_concurrent_awards_lose_no_xp() {
        let fx = Fixture::new();
        let mut handles = Vec::new();
        for _ in 0..40 {
            let engine = fx.engine.clone();
            handles.push(tokio::spawn(async move {
                engine.award("u1", XpAction::CompleteLesson, 1.0).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_some());
        }

        let profile = fx.engine.get_profile("u1").await;
        assert_eq!(profile.total_xp, 400);
        assert_eq!(profile.weekly_xp, 400);
        assert_eq!(fx.count(LEAGUE_PROMOTION).await, 0);
    }

    #[tokio::test]
    async fn test_award_achievement_is_idempotent() {
        let fx = Fixture::new();

        let first = fx.engine.award_achievement("u1", "test_ace").await.unwrap();
        assert!(!first.already_held);
        assert_eq!(first.achievement.icon, "crown");

        let second = fx.engine.award_achievement("u1", "test_ace").await.unwrap();
        assert!(second.already_held);

        assert!(fx.engine.award_achievement("u1", "moon_landing").await.is_none());
        assert_eq!(fx.engine.get_profile("u1").await.achievements, vec!["test_ace"]);
        assert_eq!(fx.count(ACHIEVEMENT_UNLOCKED).await, 1);
    }

    #[tokio::test]
    async fn test_zero_state_profile_and_ranking() {
        let fx = Fixture::new();

        let profile = fx.engine.get_profile("ghost").await;
        assert_eq!(profile, GamificationProfile::zero("ghost"));

        let ranking = fx.engine.get_ranking("ghost").await;
        assert_eq!(ranking.rank, 1);
        assert_eq!(ranking.total_in_league, 0);
        assert_eq!(ranking.percentile, 0);
    }

    #[tokio::test]
    async fn test_ranking_is_cached_until_reset() {
        let fx = Fixture::new();
        fx.engine.award("a", XpAction::LevelUp, 1.0).await;
        fx.engine.award("b", XpAction::ChallengeComplete, 1.0).await;
        fx.engine.award("c", XpAction::DailyLogin, 1.0).await;
        fx.engine.award("d", XpAction::LevelUp, 6.0).await;

        let a = fx.engine.get_ranking("a").await;
        assert_eq!((a.rank, a.total_in_league, a.percentile), (1, 3, 67));
        assert_eq!(fx.engine.get_ranking("c").await.rank, 3);

        let d = fx.engine.get_ranking("d").await;
        assert_eq!(d.league, League::Silver);
        assert_eq!((d.rank, d.total_in_league), (1, 1));

        // Cached ordering does not see new XP
        fx.engine.award("c", XpAction::LevelUp, 2.0).await;
        assert_eq!(fx.engine.get_ranking("c").await.rank, 3);

        let report = fx.engine.weekly_reset().await;
        assert_eq!(report.profiles_reset, 4);
        assert_eq!(report.caches_invalidated, 2);

        let c = fx.engine.get_profile("c").await;
        assert_eq!(c.weekly_xp, 0);
        assert_eq!(c.total_xp, 205);
        assert_eq!(fx.count(WEEKLY_RANKINGS_RESET).await, 1);

        fx.engine.award("c", XpAction::DailyLogin, 1.0).await;
        let board = fx.engine.leaderboard(League::Bronze, 2).await;
        assert_eq!(board.len(), 2);
        assert_eq!(board[0].user_id, "c");
        assert_eq!(board[0].weekly_xp, 5);
        assert_eq!(board[1].rank, 2);
    }

    #[tokio::test]
    async fn test_user_stats_details() {
        let fx = Fixture::new();
        fx.engine.award("u1", XpAction::PerfectScore, 1.0).await;
        fx.engine.award_achievement("u1", "grammar_expert").await;

        let stats = fx.engine.user_stats("u1").await;
        assert_eq!(stats.profile.total_xp, 20);
        assert_eq!(stats.ranking.rank, 1);
        assert_eq!(stats.achievements.len(), 1);
        assert_eq!(stats.achievements[0].name, "Grammar Expert");
    }

    #[tokio::test]
    async fn test_user_locks_released_after_use() {
        let fx = Fixture::new();
        let mut handles = Vec::new();
        for i in 0..200 {
            let engine = fx.engine.clone();
            handles.push(tokio::spawn(async move {
                let user = format!("user-{}", i % 50);
                engine.record_activity(&user).await;
                engine.award(&user, XpAction::CompleteLesson, 1.0).await;
                engine.award_achievement(&user, "test_ace").await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        fx.events.wait_idle().await;

        assert!(fx.engine.user_locks.is_empty());
        assert_eq!(fx.engine.get_profile("user-7").await.total_xp, 40);
    }

    #[tokio::test]
    async fn test_weekly_reset_skips_counters_it_cannot_write() {
        let backend = Arc::new(IncrementOutage::default());
        let store = Arc::new(KeyValueStore::with_backend(backend.clone(), StoreConfig::default()));
        let events = Arc::new(EventChannel::local(ChannelConfig::default()));
        let engine = GamificationEngine::with_clock(
            store.clone(),
            events,
            GamificationConfig::default(),
            Arc::new(ManualClock::at_date(NaiveDate::from_ymd_opt(2024, 4, 1).unwrap())),
        );
        engine.award("u1", XpAction::PerfectScore, 1.0).await.unwrap();

        backend.failing.store(true, Ordering::SeqCst);
        let report = engine.weekly_reset().await;
        assert_eq!(report.profiles_reset, 0);

        // Nothing was written to the in-process fallback
        assert_eq!(store.status().local.entries, 0);
        assert_eq!(engine.get_profile("u1").await.weekly_xp, 20);

        backend.failing.store(false, Ordering::SeqCst);
        assert_eq!(engine.weekly_reset().await.profiles_reset, 1);
        assert_eq!(engine.get_profile("u1").await.weekly_xp, 0);
    }
}

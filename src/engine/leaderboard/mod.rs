//! Multi-period leaderboards.
//!
//! Redis holds one sorted set per `(metric, period)` board, rebuilt wholesale by [`sync`] from the
//! durable store. Reads in [`query`] use the cache when it is warm and compute directly from the
//! durable store otherwise; a read never triggers a rebuild.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::time::error::Elapsed;

use crate::db::models::activity::{UserId, UserSignals};
use crate::db::models::leaderboard::{Metric, ScoredUser, ValidationError};
use crate::db::redis::{CacheError, LeaderboardCache};
use crate::db::repositories::ActivityStore;
use crate::db::{StoreError, StoreResult};
use crate::engine::score::{ScoreConfig, ScoreEngine};
use crate::util::env::Env;
use crate::util::with_deadline;

pub mod query;
pub mod sync;

pub use sync::SyncReport;

#[derive(Debug, Error)]
pub enum LeaderboardError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("leaderboard sync deadline exceeded")]
    DeadlineExceeded(#[from] Elapsed),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    /// Users fetched per keyset page.
    pub batch_size: i64,
    /// Bound on one whole sync run.
    pub timeout: Duration,
    /// How long a board lease survives a crashed holder.
    pub lease_ttl: Duration,
    /// Bound on each individual store or cache call.
    pub store_timeout: Duration,
}

impl SyncSettings {
    pub fn from_env(env: &Env) -> Self {
        Self {
            batch_size: env.sync_batch_size.max(1),
            timeout: Duration::from_secs(env.sync_timeout_secs),
            lease_ttl: Duration::from_secs(env.sync_lease_secs),
            store_timeout: env.store_timeout(),
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: 500,
            timeout: Duration::from_secs(120),
            lease_ttl: Duration::from_secs(180),
            store_timeout: Duration::from_millis(2_000),
        }
    }
}

pub struct Leaderboards {
    activity: Arc<dyn ActivityStore>,
    cache: Arc<dyn LeaderboardCache>,
    scores: Arc<ScoreEngine>,
    settings: SyncSettings,
}

impl Leaderboards {
    pub fn new(
        activity: Arc<dyn ActivityStore>,
        cache: Arc<dyn LeaderboardCache>,
        scores: Arc<ScoreEngine>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            activity,
            cache,
            scores,
            settings,
        }
    }

    fn config(&self) -> &ScoreConfig {
        self.scores.config()
    }

    /// Every user's signals for the window starting at `since`, walked in keyset pages.
    /// Shadow-banned users are dropped; the second value counts everyone scanned.
    async fn eligible_signals(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> StoreResult<(Vec<UserSignals>, usize)> {
        let mut eligible = Vec::new();
        let mut scanned = 0;
        let mut after: Option<UserId> = None;

        loop {
            let page = with_deadline(
                self.settings.store_timeout,
                self.activity
                    .signals_page(since, after.as_ref(), self.settings.batch_size),
            )
            .await?;

            let Some(last) = page.last() else {
                break;
            };

            let full = page.len() as i64 >= self.settings.batch_size;
            after = Some(last.user_id.clone());
            scanned += page.len();
            eligible.extend(page.into_iter().filter(|s| !s.is_shadow_banned));

            if !full {
                break;
            }
        }

        Ok((eligible, scanned))
    }
}

/// Orders `signals` by descending metric value, ties by ascending user id.
pub fn rank_signals(
    config: &ScoreConfig,
    metric: Metric,
    signals: &[UserSignals],
) -> Vec<ScoredUser> {
    let mut ranked: Vec<ScoredUser> = signals
        .iter()
        .map(|s| ScoredUser {
            user_id: s.user_id.clone(),
            score: config.metric_value(metric, s),
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.user_id.cmp(&b.user_id))
    });

    ranked
}

#[cfg(test)]
pub(crate) mod fixture {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{DateTime, TimeZone, Utc};

    use super::{Leaderboards, SyncSettings};
    use crate::db::memory::{MemoryActivityStore, MemoryCache, MemoryTrustStore};
    use crate::db::models::activity::ActivitySnapshot;
    use crate::db::models::trust::TrustRecord;
    use crate::engine::score::{ScoreConfig, ScoreEngine};
    use crate::engine::trust::TrustEngine;

    pub struct Fixture {
        pub activity: Arc<MemoryActivityStore>,
        pub trust: Arc<MemoryTrustStore>,
        pub cache: Arc<MemoryCache>,
        pub leaderboards: Leaderboards,
    }

    /// A thursday.
    pub fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 15, 15, 30, 0).unwrap()
    }

    pub fn user(id: &str, xp: i64, coins: i64, earned: f64, referrals: i64) -> ActivitySnapshot {
        ActivitySnapshot {
            user_id: id.into(),
            xp,
            coins,
            total_earned: earned,
            referral_count: referrals,
            streak_days: 3,
        }
    }

    /// `alice` and `bob` tie on xp, `carol` leads, `mallory` leads everything but is banned.
    pub fn fixture(batch_size: i64) -> Fixture {
        let trust = Arc::new(MemoryTrustStore::default());
        let activity = Arc::new(MemoryActivityStore::new(trust.clone()));
        let cache = Arc::new(MemoryCache::default());
        let timeout = Duration::from_millis(500);

        activity.insert_user(user("bob", 700, 30, 12.5, 2));
        activity.insert_user(user("alice", 700, 50, 40.0, 1));
        activity.insert_user(user("carol", 1_200, 10, 3.0, 0));
        activity.insert_user(user("dave", 0, 0, 0.0, 0));
        activity.insert_user(user("mallory", 90_000, 900, 5_000.0, 40));

        trust.set_record(TrustRecord {
            trust_score: 10,
            is_shadow_banned: true,
            shadow_banned_at: Some(now()),
            ..TrustRecord::fresh("mallory".into())
        });

        let engine = Arc::new(ScoreEngine::new(
            activity.clone(),
            Arc::new(TrustEngine::new(trust.clone(), timeout)),
            ScoreConfig::default(),
            timeout,
        ));

        let settings = SyncSettings {
            batch_size,
            timeout: Duration::from_secs(5),
            lease_ttl: Duration::from_secs(10),
            store_timeout: timeout,
        };

        let leaderboards = Leaderboards::new(activity.clone(), cache.clone(), engine, settings);

        Fixture {
            activity,
            trust,
            cache,
            leaderboards,
        }
    }
}

use chrono::{DateTime, Utc};
use tracing::instrument;

use super::{LeaderboardError, Leaderboards, rank_signals};
use crate::db::models::activity::UserId;
use crate::db::models::leaderboard::{
    AheadQuery, Board, BoardEntry, MAX_LIMIT, Metric, Period, ScoredUser, UserStanding,
    ValidationError,
};
use crate::db::redis::{CacheError, MemberLookup};
use crate::util::with_deadline;

impl Leaderboards {
    pub async fn get_leaderboard(
        &self,
        period: Period,
        metric: Metric,
        limit: usize,
    ) -> Result<Vec<BoardEntry>, LeaderboardError> {
        self.get_leaderboard_at(period, metric, limit, Utc::now())
            .await
    }

    #[instrument(skip(self, now))]
    pub async fn get_leaderboard_at(
        &self,
        period: Period,
        metric: Metric,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<BoardEntry>, LeaderboardError> {
        if !(1..=MAX_LIMIT).contains(&limit) {
            return Err(ValidationError::InvalidLimit(limit.to_string()).into());
        }

        let board = Board::new(metric, period);
        let cached = with_deadline::<_, CacheError, _>(
            self.settings.store_timeout,
            self.cache.top(board, limit),
        )
        .await;

        match cached {
            Ok(Some(entries)) => return Ok(entries),
            Ok(None) => tracing::debug!(%board, "board is cold, computing directly"),
            Err(e) => tracing::warn!(%board, error = %e, "cache unavailable, computing directly"),
        }

        let (eligible, _) = self.eligible_signals(period.window_start(now)).await?;

        Ok(rank_signals(self.config(), metric, &eligible)
            .into_iter()
            .take(limit)
            .zip(1u64..)
            .map(|(ScoredUser { user_id, score }, rank)| BoardEntry {
                user_id,
                score,
                rank,
            })
            .collect())
    }

    pub async fn get_user_standing(
        &self,
        user_id: &UserId,
        period: Period,
        metric: Metric,
    ) -> Result<UserStanding, LeaderboardError> {
        self.get_user_standing_at(user_id, period, metric, Utc::now())
            .await
    }

    /// A user's own rank and score. Users missing from a warm board (shadow-banned, or new
    /// since the last sync) are answered from their own signals plus one count of the users
    /// ahead of them, ranked as if they were listed.
    #[instrument(skip(self, now))]
    pub async fn get_user_standing_at(
        &self,
        user_id: &UserId,
        period: Period,
        metric: Metric,
        now: DateTime<Utc>,
    ) -> Result<UserStanding, LeaderboardError> {
        let board = Board::new(metric, period);
        let cached = with_deadline::<_, CacheError, _>(
            self.settings.store_timeout,
            self.cache.member(board, user_id),
        )
        .await;

        match cached {
            Ok(MemberLookup::Present { rank, score }) => {
                return Ok(UserStanding {
                    rank: Some(rank),
                    score,
                });
            }
            Ok(lookup) => tracing::debug!(%board, ?lookup, "member not cached"),
            Err(e) => tracing::warn!(%board, error = %e, "cache unavailable, computing directly"),
        }

        let since = period.window_start(now);
        let own = with_deadline(
            self.settings.store_timeout,
            self.activity.signals(user_id, since),
        )
        .await?;

        let Some(own) = own else {
            return Ok(UserStanding {
                rank: None,
                score: 0.0,
            });
        };

        let score = self.config().metric_value(metric, &own);
        let query = AheadQuery {
            user_id,
            since,
            metric,
            score,
            blend: self.config().blend(),
        };

        let ahead = with_deadline(
            self.settings.store_timeout,
            self.activity.count_ahead(&query),
        )
        .await?;

        Ok(UserStanding {
            rank: Some(ahead + 1),
            score,
        })
    }

    pub async fn get_user_rank(
        &self,
        user_id: &UserId,
        period: Period,
        metric: Metric,
    ) -> Result<Option<u64>, LeaderboardError> {
        Ok(self.get_user_standing(user_id, period, metric).await?.rank)
    }

    pub async fn get_user_score(
        &self,
        user_id: &UserId,
        period: Period,
        metric: Metric,
    ) -> Result<f64, LeaderboardError> {
        Ok(self.get_user_standing(user_id, period, metric).await?.score)
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::db::StoreError;
    use crate::engine::leaderboard::fixture::{fixture, now, user};

    fn ids(entries: &[BoardEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.user_id.0.as_str()).collect()
    }

    #[tokio::test]
    async fn test_cold_board_computes_directly_without_resync() {
        let f = fixture(2);

        let entries = f
            .leaderboards
            .get_leaderboard_at(Period::Alltime, Metric::Xp, 3, now())
            .await
            .unwrap();

        assert_eq!(ids(&entries), vec!["carol", "alice", "bob"]);
        assert_eq!(
            entries.iter().map(|e| e.rank).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(f.cache.board(Board::new(Metric::Xp, Period::Alltime)).is_none());
    }

    #[tokio::test]
    async fn test_warm_and_direct_answers_agree() {
        let f = fixture(2);

        let direct = f
            .leaderboards
            .get_leaderboard_at(Period::Alltime, Metric::SmartScore, 10, now())
            .await
            .unwrap();

        f.leaderboards.sync_leaderboards_at(now()).await.unwrap();
        let cached = f
            .leaderboards
            .get_leaderboard_at(Period::Alltime, Metric::SmartScore, 10, now())
            .await
            .unwrap();

        assert_eq!(direct, cached);
        assert!(!ids(&cached).contains(&"mallory"));
    }

    #[tokio::test]
    async fn test_unreachable_cache_falls_back() {
        let f = fixture(2);
        f.leaderboards.sync_leaderboards_at(now()).await.unwrap();
        f.cache.set_failing(true);

        let entries = f
            .leaderboards
            .get_leaderboard_at(Period::Alltime, Metric::Coins, 2, now())
            .await
            .unwrap();
        assert_eq!(ids(&entries), vec!["alice", "bob"]);

        let standing = f
            .leaderboards
            .get_user_standing_at(&"bob".into(), Period::Alltime, Metric::Xp, now())
            .await
            .unwrap();
        assert_eq!(standing.rank, Some(3));
        assert_eq!(standing.score, 700.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_cache_falls_back() {
        let f = fixture(2);
        f.cache.set_stalled(true);
        let started = tokio::time::Instant::now();

        let entries = f
            .leaderboards
            .get_leaderboard_at(Period::Alltime, Metric::Xp, 1, now())
            .await
            .unwrap();
        assert_eq!(ids(&entries), vec!["carol"]);

        // the stall is bounded by the per-call deadline, not the sleep inside the cache
        assert!(started.elapsed() < Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_ties_are_stable_across_queries() {
        let f = fixture(2);
        f.leaderboards.sync_leaderboards_at(now()).await.unwrap();

        for _ in 0..3 {
            let entries = f
                .leaderboards
                .get_leaderboard_at(Period::Alltime, Metric::Xp, 10, now())
                .await
                .unwrap();
            assert_eq!(ids(&entries), vec!["carol", "alice", "bob", "dave"]);
        }
    }

    #[tokio::test]
    async fn test_user_standing_from_cache_and_direct() {
        let f = fixture(2);

        let direct = f
            .leaderboards
            .get_user_standing_at(&"alice".into(), Period::Alltime, Metric::Xp, now())
            .await
            .unwrap();

        f.leaderboards.sync_leaderboards_at(now()).await.unwrap();
        let cached = f
            .leaderboards
            .get_user_standing_at(&"alice".into(), Period::Alltime, Metric::Xp, now())
            .await
            .unwrap();

        assert_eq!(direct, cached);
        assert_eq!(cached.rank, Some(2));
        assert_eq!(cached.score, 700.0);
    }

    #[tokio::test]
    async fn test_banned_user_sees_own_standing() {
        let f = fixture(2);
        f.leaderboards.sync_leaderboards_at(now()).await.unwrap();

        let standing = f
            .leaderboards
            .get_user_standing_at(&"mallory".into(), Period::Alltime, Metric::Xp, now())
            .await
            .unwrap();

        assert_eq!(standing.rank, Some(1));
        assert_eq!(standing.score, 90_000.0);

        let board = f
            .leaderboards
            .get_leaderboard_at(Period::Alltime, Metric::Xp, 10, now())
            .await
            .unwrap();
        assert_eq!(board[0].user_id, UserId::from("carol"));
    }

    #[tokio::test]
    async fn test_unknown_user_has_no_rank() {
        let f = fixture(2);

        let standing = f
            .leaderboards
            .get_user_standing_at(&"nobody".into(), Period::Weekly, Metric::Coins, now())
            .await
            .unwrap();

        assert_eq!(standing.rank, None);
        assert_eq!(standing.score, 0.0);
    }

    #[tokio::test]
    async fn test_rejects_bad_limit() {
        let f = fixture(2);

        for limit in [0, MAX_LIMIT + 1] {
            assert!(matches!(
                f.leaderboards
                    .get_leaderboard_at(Period::Daily, Metric::Xp, limit, now())
                    .await,
                Err(LeaderboardError::Validation(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_user_missing_from_warm_board_is_counted_not_scanned() {
        let f = fixture(2);
        f.leaderboards.sync_leaderboards_at(now()).await.unwrap();
        let pages = f.activity.page_calls();

        f.activity.insert_user(user("erin", 800, 0, 0.0, 0));
        f.activity.insert_user(user("frank", 700, 0, 0.0, 0));

        let erin = f
            .leaderboards
            .get_user_standing_at(&"erin".into(), Period::Alltime, Metric::Xp, now())
            .await
            .unwrap();
        assert_eq!(erin.rank, Some(2));
        assert_eq!(erin.score, 800.0);

        // alice and bob tie with frank and sort before him
        let frank = f
            .leaderboards
            .get_user_standing_at(&"frank".into(), Period::Alltime, Metric::Xp, now())
            .await
            .unwrap();
        assert_eq!(frank.rank, Some(5));

        assert_eq!(f.activity.page_calls(), pages);
    }

    #[tokio::test]
    async fn test_direct_smart_score_rank_matches_board() {
        let f = fixture(2);
        let board = f
            .leaderboards
            .get_leaderboard_at(Period::Alltime, Metric::SmartScore, 10, now())
            .await
            .unwrap();

        f.cache.set_failing(true);
        for entry in &board {
            let standing = f
                .leaderboards
                .get_user_standing_at(&entry.user_id, Period::Alltime, Metric::SmartScore, now())
                .await
                .unwrap();
            assert_eq!(standing.rank, Some(entry.rank));
            assert_eq!(standing.score, entry.score);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_store_is_a_deadline_error() {
        let f = fixture(2);
        f.cache.set_failing(true);
        f.activity.set_stalled(true);

        assert!(matches!(
            f.leaderboards
                .get_user_standing_at(&"bob".into(), Period::Alltime, Metric::Xp, now())
                .await,
            Err(LeaderboardError::Store(StoreError::DeadlineExceeded(_)))
        ));
        assert!(matches!(
            f.leaderboards
                .get_leaderboard_at(Period::Alltime, Metric::Xp, 10, now())
                .await,
            Err(LeaderboardError::Store(StoreError::DeadlineExceeded(_)))
        ));
    }
}

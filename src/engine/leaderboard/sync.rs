use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::instrument;

use super::{LeaderboardError, Leaderboards, rank_signals};
use crate::db::models::leaderboard::{Board, Metric, Period};
use crate::db::redis::{LeaderboardCache, Lease};
use crate::util::with_deadline;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub boards_synced: usize,
    /// Boards whose lease was held by another sync.
    pub boards_skipped: usize,
    pub users_scanned: usize,
    pub entries_written: usize,
}

impl Leaderboards {
    pub async fn sync_leaderboards(&self) -> Result<SyncReport, LeaderboardError> {
        self.sync_leaderboards_at(Utc::now()).await
    }

    /// Rebuilds all twenty boards from the durable store. Running it twice over unchanged data
    /// leaves the cache byte-for-byte the same.
    #[instrument(skip(self))]
    pub async fn sync_leaderboards_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<SyncReport, LeaderboardError> {
        let report = with_deadline(self.settings.timeout, async {
            let mut report = SyncReport::default();
            for period in Period::ALL {
                self.sync_period(period, now, &mut report).await?;
            }

            Ok::<_, LeaderboardError>(report)
        })
        .await?;

        tracing::info!(
            synced = report.boards_synced,
            skipped = report.boards_skipped,
            users = report.users_scanned,
            entries = report.entries_written,
            "leaderboards synced"
        );

        Ok(report)
    }

    #[instrument(skip(self, now, report))]
    async fn sync_period(
        &self,
        period: Period,
        now: DateTime<Utc>,
        report: &mut SyncReport,
    ) -> Result<(), LeaderboardError> {
        let (eligible, scanned) = self.eligible_signals(period.window_start(now)).await?;
        report.users_scanned += scanned;

        for metric in Metric::ALL {
            let board = Board::new(metric, period);
            let timeout = self.settings.store_timeout;

            let Some(lease) =
                with_deadline(timeout, self.cache.try_lease(board, self.settings.lease_ttl))
                    .await?
            else {
                tracing::debug!(%board, "board lease held elsewhere, skipping");
                report.boards_skipped += 1;
                continue;
            };

            let guard = LeaseGuard::new(self.cache.clone(), lease, timeout);
            let ranked = rank_signals(self.config(), metric, &eligible);
            let written = with_deadline(timeout, self.cache.replace_board(board, &ranked)).await;

            guard.release().await;
            written?;

            report.boards_synced += 1;
            report.entries_written += ranked.len();
        }

        Ok(())
    }
}

/// Holds a board lease until it is released. If the sync future is dropped first (the whole-run
/// deadline fired mid-board), the release is handed to a background task instead of waiting out
/// the lease ttl.
struct LeaseGuard {
    cache: Arc<dyn LeaderboardCache>,
    lease: Option<Lease>,
    timeout: Duration,
}

impl LeaseGuard {
    fn new(cache: Arc<dyn LeaderboardCache>, lease: Lease, timeout: Duration) -> Self {
        Self {
            cache,
            lease: Some(lease),
            timeout,
        }
    }

    async fn release(mut self) {
        if let Some(lease) = self.lease.take() {
            release_lease(self.cache.as_ref(), &lease, self.timeout).await;
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(board = %lease.board, "no runtime to release board lease");
            return;
        };

        let cache = self.cache.clone();
        let timeout = self.timeout;
        runtime.spawn(async move {
            release_lease(cache.as_ref(), &lease, timeout).await;
        });
    }
}

async fn release_lease(cache: &dyn LeaderboardCache, lease: &Lease, timeout: Duration) {
    let released: Result<(), LeaderboardError> =
        with_deadline(timeout, async { Ok(cache.release(lease).await?) }).await;

    if let Err(e) = released {
        tracing::warn!(board = %lease.board, error = %e, "failed to release board lease");
    }
}

/// Rebuilds the boards every `every`, starting immediately. A failed run is logged and the next
/// tick tries again; ticks missed while a slow run is in flight are dropped.
pub fn spawn_sync_loop(leaderboards: Arc<Leaderboards>, every: Duration) -> JoinHandle<()> {
    let every = every.max(Duration::from_secs(1));

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            if let Err(e) = leaderboards.sync_leaderboards().await {
                tracing::error!(error = %e, "scheduled leaderboard sync failed");
            }
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::db::models::activity::UserId;
    use crate::engine::leaderboard::fixture::{fixture, now};

    fn ids(entries: Option<Vec<crate::db::models::leaderboard::ScoredUser>>) -> Vec<String> {
        entries
            .unwrap()
            .into_iter()
            .map(|e| e.user_id.0)
            .collect()
    }

    #[tokio::test]
    async fn test_sync_writes_every_board_without_banned_users() {
        let f = fixture(2);
        let report = f.leaderboards.sync_leaderboards_at(now()).await.unwrap();

        assert_eq!(report.boards_synced, 20);
        assert_eq!(report.boards_skipped, 0);
        assert_eq!(report.users_scanned, 5 * 4);
        assert_eq!(report.entries_written, 4 * 20);

        for board in Board::all() {
            let entries = f.cache.board(board).unwrap();
            assert!(entries.iter().all(|e| e.user_id != UserId::from("mallory")));
            assert!(!f.cache.is_leased(board));
        }

        let xp = Board::new(Metric::Xp, Period::Alltime);
        assert_eq!(ids(f.cache.board(xp)), vec!["carol", "alice", "bob", "dave"]);

        let coins = Board::new(Metric::Coins, Period::Alltime);
        assert_eq!(ids(f.cache.board(coins)), vec!["alice", "bob", "carol", "dave"]);
    }

    #[tokio::test]
    async fn test_windowed_boards_use_the_ledger() {
        let f = fixture(10);
        let today = now() - chrono::TimeDelta::hours(1);
        let last_month = now() - chrono::TimeDelta::days(40);

        f.activity.record_activity("dave", 30, 0, 0.0, today);
        f.activity.record_activity("carol", 500, 0, 0.0, last_month);
        f.activity.record_referral("bob", today);

        f.leaderboards.sync_leaderboards_at(now()).await.unwrap();

        let daily_xp = f.cache.board(Board::new(Metric::Xp, Period::Daily)).unwrap();
        assert_eq!(daily_xp[0].user_id, UserId::from("dave"));
        assert_eq!(daily_xp[0].score, 30.0);
        assert!(daily_xp[1..].iter().all(|e| e.score == 0.0));

        let daily_refs = f
            .cache
            .board(Board::new(Metric::Referrals, Period::Daily))
            .unwrap();
        assert_eq!(daily_refs[0].user_id, UserId::from("bob"));
        assert_eq!(daily_refs[0].score, 1.0);

        let alltime_xp = f.cache.board(Board::new(Metric::Xp, Period::Alltime)).unwrap();
        assert_eq!(alltime_xp[0].user_id, UserId::from("carol"));
        assert_eq!(alltime_xp[0].score, 1_700.0);
    }

    #[tokio::test]
    async fn test_repeated_sync_is_identical() {
        let f = fixture(3);

        f.leaderboards.sync_leaderboards_at(now()).await.unwrap();
        let first: Vec<_> = Board::all().map(|b| f.cache.board(b)).collect();

        f.leaderboards.sync_leaderboards_at(now()).await.unwrap();
        let second: Vec<_> = Board::all().map(|b| f.cache.board(b)).collect();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_held_lease_skips_board() {
        let f = fixture(10);
        let held = Board::new(Metric::SmartScore, Period::Weekly);
        f.cache.hold_lease(held);

        let report = f.leaderboards.sync_leaderboards_at(now()).await.unwrap();

        assert_eq!(report.boards_synced, 19);
        assert_eq!(report.boards_skipped, 1);
        assert!(f.cache.board(held).is_none());
    }

    #[tokio::test]
    async fn test_unreachable_cache_fails_sync() {
        let f = fixture(10);
        f.cache.set_failing(true);

        assert!(matches!(
            f.leaderboards.sync_leaderboards_at(now()).await,
            Err(LeaderboardError::Cache(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_deadline_still_releases_leases() {
        let mut f = fixture(10);
        f.leaderboards.settings.timeout = Duration::from_millis(100);
        f.cache.set_stalled_writes(true);

        assert!(matches!(
            f.leaderboards.sync_leaderboards_at(now()).await,
            Err(LeaderboardError::DeadlineExceeded(_))
        ));

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(Board::all().all(|board| !f.cache.is_leased(board)));

        f.cache.set_stalled_writes(false);
        let report = f.leaderboards.sync_leaderboards_at(now()).await.unwrap();
        assert_eq!(report.boards_skipped, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_loop_warms_cache_and_survives_failures() {
        let f = fixture(10);
        let board = Board::new(Metric::Xp, Period::Alltime);
        f.cache.set_failing(true);

        let handle = spawn_sync_loop(Arc::new(f.leaderboards), Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(f.cache.board(board).is_none());

        f.cache.set_failing(false);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(f.cache.board(board).is_some());
        assert!(!handle.is_finished());

        handle.abort();
    }
}

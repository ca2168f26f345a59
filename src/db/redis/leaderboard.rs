use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use redis::Script;
use redis::aio::ConnectionManager;
use tracing::instrument;
use uuid::Uuid;

use super::redis_pool::{RedisKey, RedisPool};
use super::{CacheResult, LeaderboardCache, Lease, MemberLookup};
use crate::db::models::activity::UserId;
use crate::db::models::leaderboard::{Board, BoardEntry, ScoredUser};

/// Members written to the staging set per round trip.
const STAGING_CHUNK: usize = 1_000;

/// Staging sets outlive an aborted sync by at most this long.
const STAGING_TTL: Duration = Duration::from_secs(600);

static RELEASE_LEASE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('DEL', KEYS[1])
        end
        return 0
        "#,
    )
});

/// Sorted-set leaderboards. Scores are stored negated, so the set's natural
/// `(score asc, member asc)` order is descending score with ties broken by ascending user id.
pub struct RedisLeaderboardCache {
    manager: ConnectionManager,
}

impl RedisLeaderboardCache {
    pub fn new(pool: &RedisPool) -> Self {
        Self {
            manager: pool.manager.clone(),
        }
    }
}

fn stored(score: f64) -> f64 {
    0.0 - score
}

fn unstored(raw: f64) -> f64 {
    0.0 - raw
}

#[async_trait]
impl LeaderboardCache for RedisLeaderboardCache {
    #[instrument(skip(self), fields(board = %board))]
    async fn top(&self, board: Board, limit: usize) -> CacheResult<Option<Vec<BoardEntry>>> {
        if limit == 0 {
            return Ok(Some(Vec::new()));
        }

        let mut conn = self.manager.clone();
        let stop = isize::try_from(limit).unwrap_or(isize::MAX) - 1;

        let mut pipe = redis::pipe();
        pipe.exists(RedisKey::SyncedAt(board).to_string());
        pipe.zrange_withscores(RedisKey::Board(board).to_string(), 0, stop);

        let (warm, members): (bool, Vec<(String, f64)>) = pipe.query_async(&mut conn).await?;
        if !warm {
            tracing::debug!("board is cold");
            return Ok(None);
        }

        let entries = members
            .into_iter()
            .zip(1u64..)
            .map(|((user_id, raw), rank)| BoardEntry {
                user_id: UserId(user_id),
                score: unstored(raw),
                rank,
            })
            .collect();

        Ok(Some(entries))
    }

    #[instrument(skip(self), fields(board = %board))]
    async fn member(&self, board: Board, user_id: &UserId) -> CacheResult<MemberLookup> {
        let mut conn = self.manager.clone();
        let live = RedisKey::Board(board).to_string();

        let mut pipe = redis::pipe();
        pipe.exists(RedisKey::SyncedAt(board).to_string());
        pipe.zrank(&live, user_id.0.as_str());
        pipe.zscore(&live, user_id.0.as_str());

        let (warm, rank, raw): (bool, Option<u64>, Option<f64>) =
            pipe.query_async(&mut conn).await?;

        Ok(match (warm, rank, raw) {
            (false, _, _) => MemberLookup::Cold,
            (true, Some(rank), Some(raw)) => MemberLookup::Present {
                rank: rank + 1,
                score: unstored(raw),
            },
            (true, _, _) => MemberLookup::Absent,
        })
    }

    #[instrument(skip(self, entries), fields(board = %board, entries = entries.len()))]
    async fn replace_board(&self, board: Board, entries: &[ScoredUser]) -> CacheResult<()> {
        let mut conn = self.manager.clone();

        let token = Uuid::new_v4().simple().to_string();
        let live = RedisKey::Board(board).to_string();
        let staging = RedisKey::Staging(board, &token).to_string();
        let marker = RedisKey::SyncedAt(board).to_string();
        let synced_at = chrono::Utc::now().timestamp_millis();

        if entries.is_empty() {
            let mut pipe = redis::pipe();
            pipe.atomic();
            pipe.del(&live);
            pipe.set(&marker, synced_at);

            let _: () = pipe.query_async(&mut conn).await?;
            return Ok(());
        }

        let staging_ttl = i64::try_from(STAGING_TTL.as_millis()).unwrap_or(i64::MAX);
        for chunk in entries.chunks(STAGING_CHUNK) {
            let items: Vec<(f64, &str)> = chunk
                .iter()
                .map(|e| (stored(e.score), e.user_id.as_ref()))
                .collect();

            let mut pipe = redis::pipe();
            pipe.zadd_multiple(&staging, &items);
            pipe.pexpire(&staging, staging_ttl);

            let _: () = pipe.query_async(&mut conn).await?;
        }

        // RENAME carries the staging TTL over, so the live set is persisted in the same step
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.rename(&staging, &live);
        pipe.persist(&live);
        pipe.set(&marker, synced_at);

        let _: () = pipe.query_async(&mut conn).await?;

        tracing::debug!("board swapped in");
        Ok(())
    }

    #[instrument(skip(self), fields(board = %board))]
    async fn try_lease(&self, board: Board, ttl: Duration) -> CacheResult<Option<Lease>> {
        let mut conn = self.manager.clone();
        let token = Uuid::new_v4().to_string();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);

        let acquired: Option<String> = redis::cmd("SET")
            .arg(RedisKey::Lease(board).to_string())
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;

        Ok(acquired.map(|_| Lease { board, token }))
    }

    #[instrument(skip(self, lease), fields(board = %lease.board))]
    async fn release(&self, lease: &Lease) -> CacheResult<()> {
        let mut conn = self.manager.clone();

        let released: i64 = RELEASE_LEASE
            .key(RedisKey::Lease(lease.board).to_string())
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await?;

        if released == 0 {
            tracing::warn!("lease expired before release");
        }

        Ok(())
    }
}

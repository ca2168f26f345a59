use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::error::Elapsed;

use crate::db::models::activity::UserId;
use crate::db::models::leaderboard::{Board, BoardEntry, ScoredUser};
use crate::util::env::EnvErr;

pub mod leaderboard;
pub mod redis_pool;
pub mod window;

pub type CacheResult<T> = core::result::Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    RedisClientError(#[from] redis::RedisError),

    #[error(transparent)]
    EnvError(#[from] EnvErr),

    #[error("cache deadline exceeded")]
    DeadlineExceeded(#[from] Elapsed),

    #[error("unexpected reply from cache: {0}")]
    BadReply(String),
}

/// Where a user stands on a cached board.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MemberLookup {
    /// The board has never been written, so absence says nothing.
    Cold,
    /// The board is warm and the user is not on it.
    Absent,
    /// 1-based rank and the stored (un-negated) score.
    Present { rank: u64, score: f64 },
}

/// Proof of holding a board's sync lease. Release is token-checked, so an expired lease that
/// was taken over by another process is never released by its former holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub board: Board,
    pub token: String,
}

/// Fast-path leaderboard storage.
#[async_trait]
pub trait LeaderboardCache: Send + Sync {
    /// `Ok(None)` when the board is cold.
    async fn top(&self, board: Board, limit: usize) -> CacheResult<Option<Vec<BoardEntry>>>;

    async fn member(&self, board: Board, user_id: &UserId) -> CacheResult<MemberLookup>;

    /// Replaces the whole board with `entries` (already in rank order) and marks it synced.
    async fn replace_board(&self, board: Board, entries: &[ScoredUser]) -> CacheResult<()>;

    /// `Ok(None)` when another holder owns the lease.
    async fn try_lease(&self, board: Board, ttl: Duration) -> CacheResult<Option<Lease>>;

    async fn release(&self, lease: &Lease) -> CacheResult<()>;
}

/// Result of one admission attempt against a sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    pub admitted: bool,
    /// Entries in the window before this attempt.
    pub count: u64,
    /// Oldest surviving entry, in epoch milliseconds.
    pub oldest_ms: Option<i64>,
}

/// Per-key sliding-window log. `admit` must purge, count and insert atomically.
#[async_trait]
pub trait WindowStore: Send + Sync {
    async fn admit(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        limit: u64,
    ) -> CacheResult<WindowOutcome>;
}

use std::sync::LazyLock;

use redis::aio::ConnectionManager;
use tokio::sync::OnceCell;
use tracing::instrument;

use super::CacheResult;
use crate::db::models::leaderboard::Board;
use crate::util::env;

static REDIS_POOL: LazyLock<OnceCell<RedisPool>> = LazyLock::new(OnceCell::new);
pub async fn redis_pool() -> CacheResult<&'static RedisPool> {
    REDIS_POOL
        .get_or_try_init(|| async { RedisPool::new().await })
        .await
}

/// Cache keys. Every key of one board shares a `{board}` hash tag so the rename/marker pipeline
/// stays on one slot when run against a cluster.
#[derive(Debug, Clone)]
pub enum RedisKey<'a> {
    Board(Board),
    Staging(Board, &'a str),
    SyncedAt(Board),
    Lease(Board),
    Window { identifier: &'a str, action: &'a str },
}

impl core::fmt::Display for RedisKey<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RedisKey::Board(board) => write!(f, "leaderboard:{{{board}}}"),
            RedisKey::Staging(board, token) => {
                write!(f, "leaderboard:{{{board}}}:staging:{token}")
            }
            RedisKey::SyncedAt(board) => write!(f, "leaderboard:{{{board}}}:synced_at"),
            RedisKey::Lease(board) => write!(f, "leaderboard:{{{board}}}:lease"),
            // length prefix keeps `(identifier, action)` pairs distinct whatever they contain
            RedisKey::Window { identifier, action } => {
                write!(f, "ratelimit:{{{}:{identifier}}}:{action}", identifier.len())
            }
        }
    }
}

pub struct RedisPool {
    pub manager: ConnectionManager,
}

impl RedisPool {
    #[instrument]
    pub async fn new() -> CacheResult<Self> {
        let redis_url = &env::env().await?.redis_url;
        tracing::debug!("connecting to redis server");

        let client = redis::Client::open(redis_url.as_str())?;
        let manager = ConnectionManager::new(client).await?;

        Ok(Self { manager })
    }
}

use std::sync::LazyLock;

use async_trait::async_trait;
use redis::Script;
use redis::aio::ConnectionManager;
use tracing::instrument;

use super::redis_pool::RedisPool;
use super::{CacheResult, WindowOutcome, WindowStore};

/// Purge, count and conditionally insert in one server-side step.
///
/// `KEYS[1]` window key; `ARGV` now (ms), window (ms), limit, unique member.
/// Replies `{admitted, count, oldest}` with `oldest = -1` for an empty window.
static ADMIT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        local key = KEYS[1]
        local now = tonumber(ARGV[1])
        local window = tonumber(ARGV[2])
        local limit = tonumber(ARGV[3])

        redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)

        local count = redis.call('ZCARD', key)
        local oldest = -1
        local head = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
        if head[2] then
            oldest = tonumber(head[2])
        end

        if count >= limit then
            return {0, count, oldest}
        end

        redis.call('ZADD', key, now, ARGV[4])
        redis.call('PEXPIRE', key, window)
        return {1, count, oldest}
        "#,
    )
});

pub struct RedisWindowStore {
    manager: ConnectionManager,
}

impl RedisWindowStore {
    pub fn new(pool: &RedisPool) -> Self {
        Self {
            manager: pool.manager.clone(),
        }
    }
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    #[instrument(skip(self))]
    async fn admit(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        limit: u64,
    ) -> CacheResult<WindowOutcome> {
        let mut conn = self.manager.clone();
        let member = format!("{now_ms}-{:016x}", rand::random::<u64>());

        let (admitted, count, oldest): (i64, u64, i64) = ADMIT
            .key(key)
            .arg(now_ms)
            .arg(window_ms)
            .arg(limit)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;

        Ok(WindowOutcome {
            admitted: admitted == 1,
            count,
            oldest_ms: (oldest >= 0).then_some(oldest),
        })
    }
}

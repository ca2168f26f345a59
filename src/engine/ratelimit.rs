use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::instrument;

use crate::db::models::leaderboard::ValidationError;
use crate::db::redis::redis_pool::RedisKey;
use crate::db::redis::{CacheError, WindowStore};
use crate::util::with_deadline;

/// Longest accepted window, one leap year.
pub const MAX_WINDOW_SECS: u64 = 366 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

/// Sliding-window-log admission control keyed by `(identifier, action)`.
///
/// The limiter never turns a cache outage into a failed request: if the window store cannot be
/// reached in time the action is admitted and the degradation is logged.
pub struct RateLimiter {
    store: Arc<dyn WindowStore>,
    timeout: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn WindowStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub async fn check_and_consume(
        &self,
        identifier: &str,
        action: &str,
        limit: u64,
        window_secs: u64,
    ) -> Result<RateLimitDecision, ValidationError> {
        self.check_and_consume_at(identifier, action, limit, window_secs, Utc::now())
            .await
    }

    #[instrument(skip(self, now))]
    pub async fn check_and_consume_at(
        &self,
        identifier: &str,
        action: &str,
        limit: u64,
        window_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, ValidationError> {
        if identifier.trim().is_empty() {
            return Err(ValidationError::Empty("identifier"));
        }
        if action.trim().is_empty() {
            return Err(ValidationError::Empty("actionType"));
        }
        if window_secs == 0 {
            return Err(ValidationError::EmptyWindow);
        }
        if window_secs > MAX_WINDOW_SECS {
            return Err(ValidationError::WindowTooLong(MAX_WINDOW_SECS));
        }

        let window =
            TimeDelta::try_seconds(window_secs as i64).ok_or(ValidationError::EmptyWindow)?;

        if limit == 0 {
            return Ok(RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_at: reset_after(now, window),
            });
        }

        let key = RedisKey::Window { identifier, action }.to_string();
        let now_ms = now.timestamp_millis();

        let outcome = with_deadline::<_, CacheError, _>(
            self.timeout,
            self.store
                .admit(&key, now_ms, window.num_milliseconds(), limit),
        )
        .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(error = %e, key = %key, "rate limit store unavailable, admitting");
                return Ok(RateLimitDecision {
                    allowed: true,
                    remaining: limit - 1,
                    reset_at: reset_after(now, window),
                });
            }
        };

        let oldest = outcome
            .oldest_ms
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or(now);
        let reset_at = reset_after(oldest, window);

        if !outcome.admitted {
            tracing::debug!(key = %key, count = outcome.count, "rate limited");
            return Ok(RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_at,
            });
        }

        Ok(RateLimitDecision {
            allowed: true,
            remaining: limit.saturating_sub(outcome.count + 1),
            reset_at,
        })
    }
}

/// Saturates at the last representable instant rather than overflowing.
fn reset_after(from: DateTime<Utc>, window: TimeDelta) -> DateTime<Utc> {
    from.checked_add_signed(window).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::StoreResult;
use crate::db::models::activity::{ActivitySnapshot, UserId, UserSignals};
use crate::db::models::leaderboard::AheadQuery;
use crate::db::models::trust::{FraudEvent, NewFraudEvent, TrustRecord};

pub mod activity;
pub mod trust;

/// Read access to the activity counters the business layer maintains.
#[async_trait]
pub trait ActivityStore: Send + Sync {
    /// `Ok(None)` when the user has no activity row.
    async fn snapshot(&self, user_id: &UserId) -> StoreResult<Option<ActivitySnapshot>>;

    /// Signals for a single user over the window starting at `since` (`None` = all-time).
    async fn signals(
        &self,
        user_id: &UserId,
        since: Option<DateTime<Utc>>,
    ) -> StoreResult<Option<UserSignals>>;

    /// One keyset page of signals, ordered by ascending user id, strictly after `after`.
    async fn signals_page(
        &self,
        since: Option<DateTime<Utc>>,
        after: Option<&UserId>,
        limit: i64,
    ) -> StoreResult<Vec<UserSignals>>;

    /// Non-banned users other than `query.user_id` ranked strictly ahead of it: a higher value,
    /// or an equal value and a smaller user id.
    async fn count_ahead(&self, query: &AheadQuery<'_>) -> StoreResult<u64>;
}

/// Trust records and the append-only fraud log.
///
/// Score mutations must be atomic in the store itself; implementations never read the score
/// back into the application to write it again.
#[async_trait]
pub trait TrustStore: Send + Sync {
    async fn trust_record(&self, user_id: &UserId) -> StoreResult<Option<TrustRecord>>;

    /// Appends `event` and applies its score impact in one transaction.
    async fn record_fraud_event(&self, event: &NewFraudEvent) -> StoreResult<TrustRecord>;

    /// Applies a signed delta with the same clamp/ban transition as a fraud event, without a
    /// log entry.
    async fn adjust_trust(&self, user_id: &UserId, delta: i32) -> StoreResult<TrustRecord>;

    /// Most recent first.
    async fn fraud_events(&self, user_id: &UserId, limit: i64) -> StoreResult<Vec<FraudEvent>>;
}

pub mod sql_fragment {
    /// Clamp/ban transition for an upsert into `trust_record`. `$1` is the user id, `$2` the
    /// signed delta and `$3` the ban threshold. The delta is widened to `int8` so any `i32`
    /// clamps instead of overflowing.
    pub const TRUST_UPSERT: &str = r#"
        INSERT INTO trust_record (
            user_id,
            trust_score,
            is_shadow_banned,
            shadow_banned_at,
            updated_at
        )
        VALUES (
            $1,
            LEAST(100, GREATEST(0, 100 + $2::int8)),
            LEAST(100, GREATEST(0, 100 + $2::int8)) <= $3,
            CASE WHEN LEAST(100, GREATEST(0, 100 + $2::int8)) <= $3 THEN NOW() END,
            NOW()
        )
        ON CONFLICT (user_id)
        DO UPDATE SET
            trust_score = LEAST(100, GREATEST(0, trust_record.trust_score + $2::int8)),
            is_shadow_banned = trust_record.is_shadow_banned
                OR LEAST(100, GREATEST(0, trust_record.trust_score + $2::int8)) <= $3,
            shadow_banned_at = CASE
                WHEN NOT trust_record.is_shadow_banned
                    AND LEAST(100, GREATEST(0, trust_record.trust_score + $2::int8)) <= $3
                THEN NOW()
                ELSE trust_record.shadow_banned_at
            END,
            updated_at = NOW()
        RETURNING
            user_id,
            trust_score,
            is_shadow_banned,
            shadow_banned_at
    "#;

    pub const TRUST_FIELDS: &str = r#"
        user_id,
        trust_score,
        is_shadow_banned,
        shadow_banned_at
    "#;

    pub const FRAUD_EVENT_FIELDS: &str = r#"
        id,
        user_id,
        type,
        severity,
        score_impact,
        details,
        metadata,
        created_at
    "#;

    /// Per-user signals over an optional window. `$1` is the window start (NULL = all-time).
    /// Callers append their own `WHERE` clause on `u.id`.
    pub const SIGNALS_SELECT: &str = r#"
        SELECT
            u.id AS user_id,
            CASE WHEN $1::timestamptz IS NULL THEN u.xp ELSE COALESCE(l.xp, 0) END AS xp,
            CASE WHEN $1::timestamptz IS NULL THEN u.coins ELSE COALESCE(l.coins, 0) END AS coins,
            CASE
                WHEN $1::timestamptz IS NULL THEN u.total_earned::float8
                ELSE COALESCE(l.earned, 0)
            END AS earned,
            CASE
                WHEN $1::timestamptz IS NULL THEN u.referral_count
                ELSE COALESCE(r.referrals, 0)
            END AS referrals,
            u.streak_days AS streak_days,
            COALESCE(t.trust_score, 100) AS trust_score,
            COALESCE(t.is_shadow_banned, FALSE) AS is_shadow_banned
        FROM users u
        LEFT JOIN LATERAL (
            SELECT
                SUM(a.xp)::int8 AS xp,
                SUM(a.coins)::int8 AS coins,
                SUM(a.earned)::float8 AS earned
            FROM activity_ledger a
            WHERE a.user_id = u.id
              AND a.created_at >= $1::timestamptz
        ) l ON TRUE
        LEFT JOIN LATERAL (
            SELECT COUNT(*)::int8 AS referrals
            FROM referral rf
            WHERE rf.referrer_id = u.id
              AND rf.verified_at IS NOT NULL
              AND rf.verified_at >= $1::timestamptz
        ) r ON TRUE
        LEFT JOIN trust_record t ON t.user_id = u.id
    "#;
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};
use tracing::instrument;

use super::{ActivityStore, sql_fragment};
use crate::db::StoreResult;
use crate::db::models::activity::{ActivitySnapshot, UserId, UserSignals};
use crate::db::models::leaderboard::{AheadQuery, Metric};

/// Board value of a row `s` of [`sql_fragment::SIGNALS_SELECT`]. The smart score binds its
/// `(weight, cap)` pairs from `$4` onward and mirrors the in-process computation, including the
/// two-decimal rounding.
fn metric_expr(metric: Metric) -> String {
    let signals = [
        "s.xp::float8",
        "s.earned",
        "s.referrals::float8",
        "s.streak_days::float8",
    ];

    match metric {
        Metric::Xp => String::from("s.xp::float8"),
        Metric::Coins => String::from("s.coins::float8"),
        Metric::Earnings => String::from("s.earned"),
        Metric::Referrals => String::from("s.referrals::float8"),
        Metric::SmartScore => {
            let terms = signals
                .iter()
                .enumerate()
                .map(|(i, value)| {
                    let weight = 4 + 2 * i;
                    let cap = weight + 1;
                    format!(
                        "${weight}::float8 * CASE \
                            WHEN ${cap}::float8 <= 0 THEN (GREATEST({value}, 0) > 0)::int::float8 \
                            ELSE LEAST(1.0, LN(1 + GREATEST({value}, 0)) / LN(1 + ${cap}::float8)) \
                        END"
                    )
                })
                .collect::<Vec<_>>()
                .join(" + ");

            format!(
                "ROUND((1000 * (LEAST(100, GREATEST(0, s.trust_score))::float8 / 100) \
                    * ({terms}))::numeric, 2)::float8"
            )
        }
    }
}

#[derive(Debug)]
pub struct ActivityRepository {
    pool: &'static Pool<Postgres>,
}

impl ActivityRepository {
    pub fn new(pool: &'static Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ActivityStore for ActivityRepository {
    #[instrument(skip(self))]
    async fn snapshot(&self, user_id: &UserId) -> StoreResult<Option<ActivitySnapshot>> {
        Ok(sqlx::query_as::<_, ActivitySnapshot>(
            r#"
            SELECT
                id AS user_id,
                xp,
                coins,
                total_earned::float8 AS total_earned,
                referral_count,
                streak_days
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(self.pool)
        .await?)
    }

    #[instrument(skip(self))]
    async fn signals(
        &self,
        user_id: &UserId,
        since: Option<DateTime<Utc>>,
    ) -> StoreResult<Option<UserSignals>> {
        let query = format!("{} WHERE u.id = $2", sql_fragment::SIGNALS_SELECT);

        Ok(sqlx::query_as::<_, UserSignals>(&query)
            .bind(since)
            .bind(user_id)
            .fetch_optional(self.pool)
            .await?)
    }

    #[instrument(skip(self))]
    async fn signals_page(
        &self,
        since: Option<DateTime<Utc>>,
        after: Option<&UserId>,
        limit: i64,
    ) -> StoreResult<Vec<UserSignals>> {
        // byte-order collation so paging agrees with the leaderboard tie-break
        let query = format!(
            r#"{}
            WHERE ($2::text IS NULL OR u.id COLLATE "C" > $2::text COLLATE "C")
            ORDER BY u.id COLLATE "C" ASC
            LIMIT $3
            "#,
            sql_fragment::SIGNALS_SELECT
        );

        let rows = sqlx::query_as::<_, UserSignals>(&query)
            .bind(since)
            .bind(after)
            .bind(limit)
            .fetch_all(self.pool)
            .await?;

        tracing::trace!(count = rows.len(), "fetched signals page");
        Ok(rows)
    }

    #[instrument(skip(self, query), fields(user_id = %query.user_id, metric = ?query.metric))]
    async fn count_ahead(&self, query: &AheadQuery<'_>) -> StoreResult<u64> {
        let sql = format!(
            r#"
            WITH s AS ({})
            SELECT COUNT(*)::int8
            FROM (
                SELECT s.user_id, {} AS value
                FROM s
                WHERE NOT s.is_shadow_banned
                  AND s.user_id <> $2::text
            ) v
            WHERE v.value > $3::float8
               OR (v.value = $3::float8 AND v.user_id COLLATE "C" < $2::text COLLATE "C")
            "#,
            sql_fragment::SIGNALS_SELECT,
            metric_expr(query.metric)
        );

        let mut count = sqlx::query_scalar::<_, i64>(&sql)
            .bind(query.since)
            .bind(query.user_id)
            .bind(query.score);

        if query.metric == Metric::SmartScore {
            for (weight, cap) in query.blend {
                count = count.bind(weight).bind(cap);
            }
        }

        let ahead = count.fetch_one(self.pool).await?;
        Ok(u64::try_from(ahead).unwrap_or(0))
    }
}

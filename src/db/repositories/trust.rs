use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{Pool, Postgres};
use tracing::instrument;

use super::{TrustStore, sql_fragment};
use crate::db::StoreResult;
use crate::db::models::activity::UserId;
use crate::db::models::trust::{FraudEvent, NewFraudEvent, SHADOW_BAN_THRESHOLD, TrustRecord};

#[derive(Debug)]
pub struct TrustRepository {
    pool: &'static Pool<Postgres>,
}

impl TrustRepository {
    pub fn new(pool: &'static Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TrustStore for TrustRepository {
    #[instrument(skip(self))]
    async fn trust_record(&self, user_id: &UserId) -> StoreResult<Option<TrustRecord>> {
        Ok(sqlx::query_as::<_, TrustRecord>(&format!(
            "SELECT {} FROM trust_record WHERE user_id = $1",
            sql_fragment::TRUST_FIELDS
        ))
        .bind(user_id)
        .fetch_optional(self.pool)
        .await?)
    }

    #[instrument(skip(self, event), fields(user = %event.user_id, severity = %event.severity))]
    async fn record_fraud_event(&self, event: &NewFraudEvent) -> StoreResult<TrustRecord> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO fraud_event (
                user_id,
                type,
                severity,
                score_impact,
                details,
                metadata,
                created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            "#,
        )
        .bind(&event.user_id)
        .bind(&event.kind)
        .bind(event.severity.as_str())
        .bind(event.score_impact())
        .bind(&event.details)
        .bind(Json(&event.metadata))
        .execute(&mut *tx)
        .await?;

        let record = sqlx::query_as::<_, TrustRecord>(sql_fragment::TRUST_UPSERT)
            .bind(&event.user_id)
            .bind(event.score_impact())
            .bind(SHADOW_BAN_THRESHOLD)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::debug!(
            trust_score = record.trust_score,
            shadow_banned = record.is_shadow_banned,
            "fraud event applied"
        );

        Ok(record)
    }

    #[instrument(skip(self))]
    async fn adjust_trust(&self, user_id: &UserId, delta: i32) -> StoreResult<TrustRecord> {
        Ok(sqlx::query_as::<_, TrustRecord>(sql_fragment::TRUST_UPSERT)
            .bind(user_id)
            .bind(delta)
            .bind(SHADOW_BAN_THRESHOLD)
            .fetch_one(self.pool)
            .await?)
    }

    #[instrument(skip(self))]
    async fn fraud_events(&self, user_id: &UserId, limit: i64) -> StoreResult<Vec<FraudEvent>> {
        Ok(sqlx::query_as::<_, FraudEvent>(&format!(
            r#"
            SELECT {}
            FROM fraud_event
            WHERE user_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
            sql_fragment::FRAUD_EVENT_FIELDS
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(self.pool)
        .await?)
    }
}

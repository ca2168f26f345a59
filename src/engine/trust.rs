use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::instrument;

use crate::db::models::activity::UserId;
use crate::db::models::leaderboard::ValidationError;
use crate::db::models::trust::{ActionCheck, FraudEvent, NewFraudEvent, TrustState};
use crate::db::repositories::TrustStore;
use crate::db::{StoreError, StoreResult};
use crate::util::with_deadline;

pub const DEFAULT_EVENTS_LIMIT: i64 = 50;
pub const MAX_EVENTS_LIMIT: i64 = 500;

#[derive(Debug, Error)]
pub enum TrustError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Owns the trust score state machine. All mutations happen inside the store; the engine only
/// validates, forwards and reports.
pub struct TrustEngine {
    store: Arc<dyn TrustStore>,
    timeout: Duration,
}

impl TrustEngine {
    pub fn new(store: Arc<dyn TrustStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    #[instrument(
        skip(self, event),
        fields(user = %event.user_id, kind = %event.kind, severity = %event.severity)
    )]
    pub async fn record_fraud_event(&self, event: NewFraudEvent) -> Result<TrustState, TrustError> {
        if event.user_id.0.trim().is_empty() {
            return Err(ValidationError::Empty("userId").into());
        }
        if event.kind.trim().is_empty() {
            return Err(ValidationError::Empty("type").into());
        }

        let record = with_deadline(self.timeout, self.store.record_fraud_event(&event)).await?;

        if record.is_shadow_banned {
            tracing::info!(
                trust_score = record.trust_score,
                banned_at = ?record.shadow_banned_at,
                "user is shadow-banned"
            );
        }

        Ok(record.state())
    }

    /// Recovery hook. Applies `delta` through the same clamp and ban transition as a fraud
    /// event; it can raise a banned user's score but never lifts the ban.
    #[instrument(skip(self))]
    pub async fn adjust_trust(
        &self,
        user_id: &UserId,
        delta: i32,
        reason: &str,
    ) -> Result<TrustState, TrustError> {
        if user_id.0.trim().is_empty() {
            return Err(ValidationError::Empty("userId").into());
        }

        let record = with_deadline(self.timeout, self.store.adjust_trust(user_id, delta)).await?;
        tracing::info!(trust_score = record.trust_score, reason, "trust adjusted");

        Ok(record.state())
    }

    /// Missing records are the default state.
    #[instrument(skip(self))]
    pub async fn get_trust_state(&self, user_id: &UserId) -> StoreResult<TrustState> {
        let record = with_deadline(self.timeout, self.store.trust_record(user_id)).await?;
        Ok(record.map(|r| r.state()).unwrap_or_default())
    }

    #[instrument(skip(self))]
    pub async fn check_action_allowed(&self, user_id: &UserId) -> StoreResult<ActionCheck> {
        let state = self.get_trust_state(user_id).await?;
        Ok(ActionCheck::for_state(&state))
    }

    #[instrument(skip(self))]
    pub async fn fraud_events(
        &self,
        user_id: &UserId,
        limit: Option<i64>,
    ) -> Result<Vec<FraudEvent>, TrustError> {
        let limit = match limit {
            None => DEFAULT_EVENTS_LIMIT,
            Some(l) if (1..=MAX_EVENTS_LIMIT).contains(&l) => l,
            Some(l) => return Err(ValidationError::InvalidLimit(l.to_string()).into()),
        };

        Ok(with_deadline(self.timeout, self.store.fraud_events(user_id, limit)).await?)
    }
}

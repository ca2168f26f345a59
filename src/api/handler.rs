use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::api::middleware::identity::RequestUser;
use crate::api::server::{AppState, JsonResult};
use crate::db::models::leaderboard::parse_limit;
use crate::db::prelude::*;
use crate::engine::prelude::*;

#[derive(Debug, Default, Deserialize)]
pub struct LeaderboardParams {
    pub period: Option<String>,
    pub metric: Option<String>,
    pub limit: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LeaderboardResponse {
    pub period: Period,
    pub metric: Metric,
    pub entries: Vec<BoardEntry>,
    pub me: Option<UserStanding>,
}

#[instrument(skip(state))]
pub async fn leaderboard(
    State(state): State<Arc<AppState>>,
    user: RequestUser,
    Query(params): Query<LeaderboardParams>,
) -> JsonResult<LeaderboardResponse> {
    let period = match params.period.as_deref() {
        Some(p) => p.parse::<Period>()?,
        None => Period::Alltime,
    };
    let metric = match params.metric.as_deref() {
        Some(m) => m.parse::<Metric>()?,
        None => Metric::Xp,
    };
    let limit = parse_limit(params.limit.as_deref())?;

    let entries = state
        .leaderboards
        .get_leaderboard(period, metric, limit)
        .await?;

    let me = match user.0 {
        Some(user_id) => Some(
            state
                .leaderboards
                .get_user_standing(&user_id, period, metric)
                .await?,
        ),
        None => None,
    };

    Ok(Json(LeaderboardResponse {
        period,
        metric,
        entries,
        me,
    }))
}

#[instrument(skip(state))]
pub async fn my_progress(
    State(state): State<Arc<AppState>>,
    user: RequestUser,
) -> JsonResult<GamificationStats> {
    let user_id = user.require()?;
    Ok(Json(state.scores.get_gamification_stats(&user_id).await?))
}

#[instrument(skip(state))]
pub async fn user_progress(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<UserId>,
) -> JsonResult<GamificationStats> {
    Ok(Json(state.scores.get_gamification_stats(&user_id).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitRequest {
    pub identifier: String,
    pub action_type: String,
    pub limit: u64,
    pub window_seconds: u64,
}

#[instrument(skip(state))]
pub async fn rate_limit(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RateLimitRequest>,
) -> JsonResult<RateLimitDecision> {
    let decision = state
        .rate_limiter
        .check_and_consume(&req.identifier, &req.action_type, req.limit, req.window_seconds)
        .await?;

    Ok(Json(decision))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FraudRequest {
    pub user_id: UserId,
    #[serde(rename = "type")]
    pub kind: String,
    pub severity: String,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[instrument(skip(state))]
pub async fn record_fraud(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FraudRequest>,
) -> JsonResult<TrustState> {
    let event = NewFraudEvent {
        user_id: req.user_id,
        kind: req.kind,
        severity: req.severity.parse::<Severity>()?,
        details: req.details,
        metadata: req.metadata.unwrap_or_else(|| serde_json::json!({})),
    };

    Ok(Json(state.trust.record_fraud_event(event).await?))
}

#[derive(Debug, Deserialize)]
pub struct AdjustRequest {
    pub delta: i32,
    #[serde(default)]
    pub reason: String,
}

#[instrument(skip(state))]
pub async fn adjust_trust(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<UserId>,
    Json(req): Json<AdjustRequest>,
) -> JsonResult<TrustState> {
    Ok(Json(
        state
            .trust
            .adjust_trust(&user_id, req.delta, &req.reason)
            .await?,
    ))
}

#[instrument(skip(state))]
pub async fn trust_state(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<UserId>,
) -> JsonResult<TrustState> {
    Ok(Json(state.trust.get_trust_state(&user_id).await?))
}

#[instrument(skip(state))]
pub async fn action_allowed(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<UserId>,
) -> JsonResult<ActionCheck> {
    Ok(Json(state.trust.check_action_allowed(&user_id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsParams {
    pub limit: Option<i64>,
}

#[instrument(skip(state))]
pub async fn fraud_events(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<UserId>,
    Query(params): Query<EventsParams>,
) -> JsonResult<Vec<FraudEvent>> {
    Ok(Json(state.trust.fraud_events(&user_id, params.limit).await?))
}

#[instrument(skip(state))]
pub async fn sync_leaderboards(State(state): State<Arc<AppState>>) -> JsonResult<SyncReport> {
    Ok(Json(state.leaderboards.sync_leaderboards().await?))
}

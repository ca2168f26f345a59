use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{MatchedPath, Request};
use axum::middleware::{Next, from_fn, from_fn_with_state};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use http::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::instrument;

use crate::api::handler::*;
use crate::api::middleware::verify_internal::verify_internal_ident;
use crate::db::StoreError;
use crate::db::models::leaderboard::ValidationError;
use crate::db::models::trust::UnknownSeverity;
use crate::engine::prelude::*;

pub type JsonResult<T> = core::result::Result<Json<T>, RouteError>;

pub struct AppState {
    pub rate_limiter: Arc<RateLimiter>,
    pub trust: Arc<TrustEngine>,
    pub scores: Arc<ScoreEngine>,
    pub leaderboards: Arc<Leaderboards>,
    pub internal_token: String,
}

impl core::fmt::Debug for AppState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let internal_routes = Router::new()
        .route("/internal/rate-limit", post(rate_limit))
        .route("/internal/fraud", post(record_fraud))
        .route("/internal/trust/{user_id}", get(trust_state))
        .route("/internal/trust/{user_id}/adjust", post(adjust_trust))
        .route("/internal/trust/{user_id}/allowed", get(action_allowed))
        .route("/internal/trust/{user_id}/events", get(fraud_events))
        .route("/internal/leaderboard/sync", post(sync_leaderboards))
        .route_layer(from_fn_with_state(state.clone(), verify_internal_ident));

    Router::new()
        .merge(internal_routes)
        .route("/", get(|| async { Response::new(Body::empty()) }))
        .route("/leaderboard", get(leaderboard))
        .route("/progress", get(my_progress))
        .route("/progress/{user_id}", get(user_progress))
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
                let method = req.method();
                let uri = req.uri();

                let matched_path = req
                    .extensions()
                    .get::<MatchedPath>()
                    .map(|matched| matched.as_str());

                tracing::debug_span!("api_request", ?method, ?uri, ?matched_path)
            }),
        )
        .layer(from_fn(log_route_errors))
        .with_state(state)
}

/// Logs `RouteError`s carried in response extensions.
#[instrument(skip(request, next), fields(uri = request.uri().to_string()))]
async fn log_route_errors(request: Request, next: Next) -> Response {
    let res = next.run(request).await;
    if let Some(err) = res.extensions().get::<Arc<RouteError>>() {
        tracing::error!(error = ?err, "error occurred inside route handler");
    }

    res
}

/// Binds the listener and serves the API on a background task.
#[instrument(skip(state))]
pub async fn start_server(state: Arc<AppState>, port: u16) -> std::io::Result<JoinHandle<()>> {
    let socket_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    let listener = tokio::net::TcpListener::bind(socket_addr).await?;
    let app = router(state);

    tracing::info!(
        server_url = &format!("http://127.0.0.1:{}", socket_addr.port()),
        "server ready"
    );

    Ok(tokio::task::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = ?e, "api server stopped");
        }
    }))
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Severity(#[from] UnknownSeverity),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Trust(#[from] TrustError),

    #[error(transparent)]
    Leaderboard(#[from] LeaderboardError),

    #[error("missing user identity")]
    MissingIdentity,
}

const UNAVAILABLE: &str = "service temporarily unavailable";
const INTERNAL: &str = "internal server error";

fn store_status(err: &StoreError) -> (StatusCode, &'static str) {
    if err.is_retryable() {
        (StatusCode::SERVICE_UNAVAILABLE, UNAVAILABLE)
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, INTERNAL)
    }
}

impl IntoResponse for RouteError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            message: String,
        }

        let (status, message, err) = match &self {
            RouteError::Validation(e) => (StatusCode::BAD_REQUEST, e.to_string(), None),

            RouteError::Severity(e) => (StatusCode::BAD_REQUEST, e.to_string(), None),

            RouteError::MissingIdentity => (
                StatusCode::UNAUTHORIZED,
                String::from("missing user identity"),
                None,
            ),

            RouteError::Store(e)
            | RouteError::Trust(TrustError::Store(e))
            | RouteError::Leaderboard(LeaderboardError::Store(e)) => {
                let (status, message) = store_status(e);
                (status, message.to_string(), Some(self))
            }

            RouteError::Trust(TrustError::Validation(e))
            | RouteError::Leaderboard(LeaderboardError::Validation(e)) => {
                (StatusCode::BAD_REQUEST, e.to_string(), None)
            }

            RouteError::Leaderboard(LeaderboardError::Cache(_))
            | RouteError::Leaderboard(LeaderboardError::DeadlineExceeded(_)) => (
                StatusCode::SERVICE_UNAVAILABLE,
                UNAVAILABLE.to_string(),
                Some(self),
            ),
        };

        let mut response = (status, Json(ErrorResponse { message })).into_response();
        if let Some(err) = err {
            response.extensions_mut().insert(Arc::new(err));
        }

        response
    }
}

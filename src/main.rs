use std::sync::Arc;

use futures::future::join_all;
use thiserror::Error;

use crate::api::server::{AppState, start_server};
use crate::args::Command;
use crate::db::prelude::*;
use crate::db::redis::CacheError;
use crate::db::redis::leaderboard::RedisLeaderboardCache;
use crate::db::redis::redis_pool::redis_pool;
use crate::db::redis::window::RedisWindowStore;
use crate::engine::leaderboard::sync::spawn_sync_loop;
use crate::engine::prelude::*;
use crate::util::env::{self, Env, EnvErr};
use crate::util::telemetry;

mod api;
mod args;
mod db;
mod engine;
mod util;

#[derive(Debug, Error)]
enum RunnerErr {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Std(#[from] Box<dyn std::error::Error>),

    #[error(transparent)]
    Env(#[from] EnvErr),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Leaderboard(#[from] LeaderboardError),
}

type Result<T> = core::result::Result<T, RunnerErr>;

async fn build_state(env: &Env) -> Result<Arc<AppState>> {
    let pool = db_pool().await?;
    let redis = redis_pool().await?;
    let timeout = env.store_timeout();

    let activity: Arc<dyn ActivityStore> = Arc::new(ActivityRepository::new(pool));
    let trust = Arc::new(TrustEngine::new(
        Arc::new(TrustRepository::new(pool)),
        timeout,
    ));

    let scores = Arc::new(ScoreEngine::new(
        activity.clone(),
        trust.clone(),
        ScoreConfig::from_env(env),
        timeout,
    ));

    let leaderboards = Arc::new(Leaderboards::new(
        activity,
        Arc::new(RedisLeaderboardCache::new(redis)),
        scores.clone(),
        SyncSettings::from_env(env),
    ));

    let rate_limiter = Arc::new(RateLimiter::new(
        Arc::new(RedisWindowStore::new(redis)),
        timeout,
    ));

    Ok(Arc::new(AppState {
        rate_limiter,
        trust,
        scores,
        leaderboards,
        internal_token: env.internal_token.clone(),
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = args::parse_cli_args();
    let env = env::env().await?;
    let telemetry_registry = telemetry::Telemetry::new(env)?.register();

    tracing::info!(command = ?cli.command(), "starting earnboard");
    let state = build_state(env).await?;

    match cli.command() {
        Command::Serve { port } => {
            let port = port.unwrap_or(env.server_api_port);
            let handles = vec![
                start_server(state.clone(), port).await?,
                spawn_sync_loop(state.leaderboards.clone(), env.sync_interval()),
            ];

            tokio::select! {
                _ = join_all(handles) => {}
                _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
            }
        }

        Command::Sync => {
            let report = state.leaderboards.sync_leaderboards().await?;
            tracing::info!(?report, "one-shot sync finished");
        }
    }

    telemetry_registry.shutdown();
    Ok(())
}

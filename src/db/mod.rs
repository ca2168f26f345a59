use std::sync::LazyLock;

use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio::time::error::Elapsed;

use crate::util::env::{self, EnvErr};

#[cfg(test)]
pub mod memory;
pub mod models;
pub mod redis;
pub mod repositories;

pub mod prelude {
    pub use crate::db::db_pool;
    pub use crate::db::{StoreError, StoreResult};

    pub use crate::db::models::activity::{ActivitySnapshot, UserId, UserSignals};
    pub use crate::db::models::leaderboard::{
        Board, BoardEntry, Metric, Period, ScoredUser, UserStanding, ValidationError,
    };
    pub use crate::db::models::trust::{
        ActionCheck, FraudEvent, NewFraudEvent, Severity, TrustRecord, TrustState,
    };

    pub use crate::db::repositories::activity::ActivityRepository;
    pub use crate::db::repositories::trust::TrustRepository;
    pub use crate::db::repositories::{ActivityStore, TrustStore};
}

static DB_POOL: LazyLock<OnceCell<Db>> = LazyLock::new(OnceCell::new);
pub async fn db_pool() -> StoreResult<&'static PgPool> {
    Ok(&DB_POOL
        .get_or_try_init(|| async { Db::new_pool().await })
        .await?
        .pool)
}

struct Db {
    pool: PgPool,
}

impl Db {
    pub async fn new_pool() -> StoreResult<Self> {
        let db_url = &env::env().await?.database_url;
        let pool = sqlx::PgPool::connect(db_url).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::info!("database migrations applied");

        Ok(Self { pool })
    }
}

pub type StoreResult<T> = core::result::Result<T, StoreError>;

/// Durable store failures. All of them are surfaced to callers as retryable; the store is the
/// source of truth and nothing papers over it with stale or zero data.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    SqlxError(#[from] sqlx::Error),

    #[error(transparent)]
    MigrateError(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    EnvError(#[from] EnvErr),

    #[error("durable store deadline exceeded")]
    DeadlineExceeded(#[from] Elapsed),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::DeadlineExceeded(_) => true,
            StoreError::SqlxError(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            StoreError::MigrateError(_) | StoreError::EnvError(_) => false,
        }
    }
}

pub mod leaderboard;
pub mod ratelimit;
pub mod score;
pub mod trust;

pub mod prelude {
    pub use crate::engine::leaderboard::{LeaderboardError, Leaderboards, SyncReport, SyncSettings};
    pub use crate::engine::ratelimit::{RateLimitDecision, RateLimiter};
    pub use crate::engine::score::{GamificationStats, ScoreConfig, ScoreEngine};
    pub use crate::engine::trust::{TrustEngine, TrustError};
}

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::db::models::trust::DEFAULT_TRUST_SCORE;

/// Opaque user identifier issued by the account layer.
///
/// Ordering is plain byte order, which is also the tie-break order for equal leaderboard scores.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct UserId(pub String);

/// Base `users` row: the counters the business layer maintains for each account.
#[derive(Debug, Clone, Default, PartialEq, sqlx::FromRow)]
pub struct ActivitySnapshot {
    pub user_id: UserId,
    pub xp: i64,
    pub coins: i64,
    pub total_earned: f64,
    pub referral_count: i64,
    pub streak_days: i64,
}

impl ActivitySnapshot {
    /// A brand-new account has a valid, all-zero snapshot.
    pub fn empty(user_id: UserId) -> Self {
        Self {
            user_id,
            ..Default::default()
        }
    }
}

/// Raw inputs for one user over one period window, joined with their trust state.
///
/// For a bounded window the counters are ledger sums since the window start; for all-time they
/// are the snapshot counters. `streak_days` is always the current streak.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct UserSignals {
    pub user_id: UserId,
    pub xp: i64,
    pub coins: i64,
    pub earned: f64,
    pub referrals: i64,
    pub streak_days: i64,
    pub trust_score: i32,
    pub is_shadow_banned: bool,
}

impl UserSignals {
    pub fn empty(user_id: UserId) -> Self {
        Self {
            user_id,
            xp: 0,
            coins: 0,
            earned: 0.0,
            referrals: 0,
            streak_days: 0,
            trust_score: DEFAULT_TRUST_SCORE,
            is_shadow_banned: false,
        }
    }
}

impl From<&ActivitySnapshot> for UserSignals {
    fn from(value: &ActivitySnapshot) -> Self {
        Self {
            user_id: value.user_id.clone(),
            xp: value.xp,
            coins: value.coins,
            earned: value.total_earned,
            referrals: value.referral_count,
            streak_days: value.streak_days,
            trust_score: DEFAULT_TRUST_SCORE,
            is_shadow_banned: false,
        }
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        UserId(value)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        UserId(value.to_string())
    }
}

impl AsRef<str> for UserId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

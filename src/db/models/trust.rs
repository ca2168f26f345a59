use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::postgres::PgRow;

use super::activity::UserId;

pub const DEFAULT_TRUST_SCORE: i32 = 100;
pub const MIN_TRUST_SCORE: i32 = 0;
pub const MAX_TRUST_SCORE: i32 = 100;

/// A mutation landing the score at or below this value shadow-bans the user.
pub const SHADOW_BAN_THRESHOLD: i32 = 20;

/// Below this the user is not blocked, but their contributions are discounted.
pub const TRUST_THRESHOLD_LOW: i32 = 40;

pub const RESTRICTED_REASON: &str = "Account restricted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const fn score_impact(self) -> i32 {
        match self {
            Severity::Low => -5,
            Severity::Medium => -15,
            Severity::High => -30,
            Severity::Critical => -50,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown severity '{0}'")]
pub struct UnknownSeverity(pub String);

impl FromStr for Severity {
    type Err = UnknownSeverity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Ok(Severity::Low),
            "MEDIUM" => Ok(Severity::Medium),
            "HIGH" => Ok(Severity::High),
            "CRITICAL" => Ok(Severity::Critical),
            _ => Err(UnknownSeverity(s.to_string())),
        }
    }
}

/// Base `trust_record` table model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct TrustRecord {
    pub user_id: UserId,
    pub trust_score: i32,
    pub is_shadow_banned: bool,
    pub shadow_banned_at: Option<DateTime<Utc>>,
}

impl TrustRecord {
    pub fn fresh(user_id: UserId) -> Self {
        Self {
            user_id,
            trust_score: DEFAULT_TRUST_SCORE,
            is_shadow_banned: false,
            shadow_banned_at: None,
        }
    }

    /// Applies a signed delta: the score is clamped to `[0, 100]` and the ban flag can only be
    /// set, never cleared. `shadow_banned_at` is stamped on the transition into the ban.
    ///
    /// The Postgres repository evaluates the same transition inside its upsert statement.
    pub fn apply_delta(&self, delta: i32, now: DateTime<Utc>) -> Self {
        let trust_score = self
            .trust_score
            .saturating_add(delta)
            .clamp(MIN_TRUST_SCORE, MAX_TRUST_SCORE);
        let crosses = trust_score <= SHADOW_BAN_THRESHOLD;

        let shadow_banned_at = match (self.is_shadow_banned, crosses) {
            (false, true) => Some(now),
            _ => self.shadow_banned_at,
        };

        Self {
            user_id: self.user_id.clone(),
            trust_score,
            is_shadow_banned: self.is_shadow_banned || crosses,
            shadow_banned_at,
        }
    }

    pub fn state(&self) -> TrustState {
        TrustState {
            trust_score: self.trust_score,
            is_shadow_banned: self.is_shadow_banned,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustState {
    pub trust_score: i32,
    pub is_shadow_banned: bool,
}

impl Default for TrustState {
    fn default() -> Self {
        Self {
            trust_score: DEFAULT_TRUST_SCORE,
            is_shadow_banned: false,
        }
    }
}

impl TrustState {
    /// Weight applied to the user's own smart score.
    pub fn multiplier(&self) -> f64 {
        f64::from(self.trust_score.clamp(MIN_TRUST_SCORE, MAX_TRUST_SCORE))
            / f64::from(MAX_TRUST_SCORE)
    }

    pub fn is_low_trust(&self) -> bool {
        self.trust_score < TRUST_THRESHOLD_LOW
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionCheck {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Trust below [`TRUST_THRESHOLD_LOW`]; callers discount this user's contributions.
    pub low_trust: bool,
}

impl ActionCheck {
    pub fn for_state(state: &TrustState) -> Self {
        let (allowed, reason) = if state.is_shadow_banned {
            (false, Some(RESTRICTED_REASON.to_string()))
        } else {
            (true, None)
        };

        Self {
            allowed,
            reason,
            low_trust: state.is_low_trust(),
        }
    }
}

/// A fraud report that has not been written to the log yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewFraudEvent {
    pub user_id: UserId,
    pub kind: String,
    pub severity: Severity,
    pub details: String,
    pub metadata: serde_json::Value,
}

impl NewFraudEvent {
    pub fn score_impact(&self) -> i32 {
        self.severity.score_impact()
    }
}

/// Base `fraud_event` table model. Rows are append-only.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FraudEvent {
    pub id: i64,
    pub user_id: UserId,
    #[serde(rename = "type")]
    pub kind: String,
    pub severity: Severity,
    pub score_impact: i32,
    pub details: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for FraudEvent {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let severity: String = row.try_get("severity")?;
        let severity = severity
            .parse::<Severity>()
            .map_err(|e| sqlx::Error::ColumnDecode {
                index: "severity".into(),
                source: Box::new(e),
            })?;

        let metadata: sqlx::types::Json<serde_json::Value> = row.try_get("metadata")?;

        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            kind: row.try_get("type")?,
            severity,
            score_impact: row.try_get("score_impact")?,
            details: row.try_get("details")?,
            metadata: metadata.0,
            created_at: row.try_get("created_at")?,
        })
    }
}

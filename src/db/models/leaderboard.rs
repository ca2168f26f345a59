use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Datelike, Days, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::activity::UserId;

pub const DEFAULT_LIMIT: usize = 10;
pub const MAX_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid metric '{0}'")]
    InvalidMetric(String),

    #[error("invalid period '{0}'")]
    InvalidPeriod(String),

    #[error("invalid limit '{0}' (expected 1..={MAX_LIMIT})")]
    InvalidLimit(String),

    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("window must be at least one second")]
    EmptyWindow,

    #[error("window must be at most {0} seconds")]
    WindowTooLong(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Xp,
    Coins,
    Earnings,
    Referrals,
    SmartScore,
}

impl Metric {
    pub const ALL: [Metric; 5] = [
        Metric::Xp,
        Metric::Coins,
        Metric::Earnings,
        Metric::Referrals,
        Metric::SmartScore,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Metric::Xp => "xp",
            Metric::Coins => "coins",
            Metric::Earnings => "earnings",
            Metric::Referrals => "referrals",
            Metric::SmartScore => "smart_score",
        }
    }
}

impl FromStr for Metric {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Metric::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| ValidationError::InvalidMetric(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Daily,
    Weekly,
    Monthly,
    Alltime,
}

impl Period {
    pub const ALL: [Period; 4] = [
        Period::Daily,
        Period::Weekly,
        Period::Monthly,
        Period::Alltime,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Period::Daily => "daily",
            Period::Weekly => "weekly",
            Period::Monthly => "monthly",
            Period::Alltime => "alltime",
        }
    }

    /// Inclusive UTC start of the window containing `now`; `None` for all-time.
    ///
    /// Weeks start on Monday.
    pub fn window_start(self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let today = now.date_naive();
        let start = match self {
            Period::Daily => today,
            Period::Weekly => {
                today - Days::new(u64::from(today.weekday().num_days_from_monday()))
            }
            Period::Monthly => today.with_day(1)?,
            Period::Alltime => return None,
        };

        Some(start.and_time(NaiveTime::MIN).and_utc())
    }
}

impl FromStr for Period {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Period::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| ValidationError::InvalidPeriod(s.to_string()))
    }
}

/// One cached ranking: a (metric, period) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Board {
    pub metric: Metric,
    pub period: Period,
}

impl Board {
    pub const fn new(metric: Metric, period: Period) -> Self {
        Self { metric, period }
    }

    pub fn all() -> impl Iterator<Item = Board> {
        Period::ALL
            .into_iter()
            .flat_map(|p| Metric::ALL.into_iter().map(move |m| Board::new(m, p)))
    }
}

impl fmt::Display for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.metric.as_str(), self.period.as_str())
    }
}

/// Validated `limit` query parameter.
pub fn parse_limit(raw: Option<&str>) -> Result<usize, ValidationError> {
    let Some(raw) = raw else {
        return Ok(DEFAULT_LIMIT);
    };

    match raw.trim().parse::<usize>() {
        Ok(limit) if (1..=MAX_LIMIT).contains(&limit) => Ok(limit),
        _ => Err(ValidationError::InvalidLimit(raw.to_string())),
    }
}

/// A computed (user, value) pair, already in rank order when produced by the sync job.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredUser {
    pub user_id: UserId,
    pub score: f64,
}

/// Asks the durable store how many eligible users rank strictly ahead of `user_id`, who holds
/// `score` on the `metric` board for the window starting at `since`.
#[derive(Debug, Clone, Copy)]
pub struct AheadQuery<'a> {
    pub user_id: &'a UserId,
    pub since: Option<DateTime<Utc>>,
    pub metric: Metric,
    pub score: f64,
    /// Normalised smart-score `(weight, cap)` per signal: xp, earnings, referrals, streak.
    pub blend: [(f64, f64); 4],
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardEntry {
    pub user_id: UserId,
    pub score: f64,
    pub rank: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStanding {
    pub rank: Option<u64>,
    pub score: f64,
}

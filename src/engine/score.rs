use core::fmt;
use core::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;
use tracing::instrument;

use crate::db::StoreResult;
use crate::db::models::activity::{ActivitySnapshot, UserId, UserSignals};
use crate::db::models::leaderboard::Metric;
use crate::db::models::trust::TrustState;
use crate::db::repositories::ActivityStore;
use crate::engine::trust::TrustEngine;
use crate::util::env::Env;
use crate::util::with_deadline;

pub const FIRST_REFERRAL: i64 = 1;
pub const NETWORK_BUILDER_REFERRALS: i64 = 10;
pub const WEEK_STREAK_DAYS: i64 = 7;
pub const MONTH_STREAK_DAYS: i64 = 30;
pub const HIGH_EARNER_TOTAL: f64 = 1_000.0;

const SMART_SCORE_SCALE: f64 = 1_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RankTier {
    Newbie,
    Pro,
    Elite,
    Master,
    Legend,
}

impl RankTier {
    pub const fn as_str(self) -> &'static str {
        match self {
            RankTier::Newbie => "NEWBIE",
            RankTier::Pro => "PRO",
            RankTier::Elite => "ELITE",
            RankTier::Master => "MASTER",
            RankTier::Legend => "LEGEND",
        }
    }
}

impl fmt::Display for RankTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RankParseError {
    #[error("unknown rank tier '{0}'")]
    UnknownTier(String),

    #[error("rank step '{0}' is not TIER:XP")]
    Malformed(String),
}

impl FromStr for RankTier {
    type Err = RankParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NEWBIE" => Ok(RankTier::Newbie),
            "PRO" => Ok(RankTier::Pro),
            "ELITE" => Ok(RankTier::Elite),
            "MASTER" => Ok(RankTier::Master),
            "LEGEND" => Ok(RankTier::Legend),
            _ => Err(RankParseError::UnknownTier(s.trim().to_owned())),
        }
    }
}

/// One `TIER:XP` entry of a configured rank ladder, e.g. `PRO:500`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct RankStep {
    pub tier: RankTier,
    pub threshold: i64,
}

impl FromStr for RankStep {
    type Err = RankParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || RankParseError::Malformed(s.to_owned());
        let (tier, threshold) = s.split_once(':').ok_or_else(malformed)?;

        Ok(Self {
            tier: tier.parse()?,
            threshold: threshold.trim().parse().map_err(|_| malformed())?,
        })
    }
}

impl TryFrom<String> for RankStep {
    type Error = RankParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Ordered `(tier, xp threshold)` pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct RankTable {
    tiers: Vec<(RankTier, i64)>,
}

impl Default for RankTable {
    fn default() -> Self {
        Self {
            tiers: vec![
                (RankTier::Newbie, 0),
                (RankTier::Pro, 500),
                (RankTier::Elite, 2_000),
                (RankTier::Master, 5_000),
                (RankTier::Legend, 10_000),
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankProgress {
    pub tier: RankTier,
    pub next_rank_xp: Option<i64>,
    pub progress_pct: f64,
}

impl RankTable {
    /// An empty table falls back to the default ladder.
    pub fn new(mut tiers: Vec<(RankTier, i64)>) -> Self {
        if tiers.is_empty() {
            return Self::default();
        }

        tiers.sort_by_key(|(_, threshold)| *threshold);
        Self { tiers }
    }

    /// Index of the highest tier whose threshold is at most `xp`. A threshold is reached
    /// exactly at its value.
    fn position(&self, xp: i64) -> usize {
        self.tiers
            .iter()
            .rposition(|(_, threshold)| *threshold <= xp)
            .unwrap_or(0)
    }

    pub fn progress(&self, xp: i64) -> RankProgress {
        let idx = self.position(xp);
        let (tier, current) = self.tiers[idx];

        let Some(&(_, next)) = self.tiers.get(idx + 1) else {
            return RankProgress {
                tier,
                next_rank_xp: None,
                progress_pct: 100.0,
            };
        };

        let span = (next - current).max(1) as f64;
        let pct = ((xp - current) as f64 / span * 100.0).clamp(0.0, 100.0);

        RankProgress {
            tier,
            next_rank_xp: Some(next),
            progress_pct: round_to(pct, 1),
        }
    }

    /// Tiers reached at `xp`, lowest first.
    pub fn reached(&self, xp: i64) -> impl Iterator<Item = RankTier> + '_ {
        self.tiers
            .iter()
            .filter(move |(_, threshold)| *threshold <= xp)
            .map(|(tier, _)| *tier)
    }
}

/// One value per smart-score input signal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalSet {
    pub xp: f64,
    pub earnings: f64,
    pub referrals: f64,
    pub streak: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreConfig {
    pub ranks: RankTable,
    pub weights: SignalSet,
    /// Value at which a signal saturates its share of the score.
    pub caps: SignalSet,
}

impl Default for ScoreConfig {
    fn default() -> Self {
        Self {
            ranks: RankTable::default(),
            weights: SignalSet {
                xp: 0.4,
                earnings: 0.3,
                referrals: 0.2,
                streak: 0.1,
            },
            caps: SignalSet {
                xp: 50_000.0,
                earnings: 10_000.0,
                referrals: 100.0,
                streak: 365.0,
            },
        }
    }
}

impl ScoreConfig {
    pub fn from_env(env: &Env) -> Self {
        let ladder = env
            .score_ranks
            .iter()
            .map(|step| (step.tier, step.threshold))
            .collect();

        Self {
            ranks: RankTable::new(ladder),
            weights: SignalSet {
                xp: env.score_weight_xp,
                earnings: env.score_weight_earnings,
                referrals: env.score_weight_referrals,
                streak: env.score_weight_streak,
            },
            caps: SignalSet {
                xp: env.score_cap_xp,
                earnings: env.score_cap_earnings,
                referrals: env.score_cap_referrals,
                streak: env.score_cap_streak,
            },
        }
    }

    /// Weights normalised to sum to one, paired with their caps, in xp, earnings, referrals,
    /// streak order. Negative weights count as zero.
    pub fn blend(&self) -> [(f64, f64); 4] {
        let w = self.weights;
        let c = self.caps;

        let raw = [
            (w.xp, c.xp),
            (w.earnings, c.earnings),
            (w.referrals, c.referrals),
            (w.streak, c.streak),
        ];

        let total: f64 = raw.iter().map(|(w, _)| w.max(0.0)).sum();
        raw.map(|(w, cap)| {
            let share = if total > 0.0 { w.max(0.0) / total } else { 0.0 };
            (share, cap)
        })
    }

    /// Rounded to two decimals. Depends only on the user's own signals.
    pub fn smart_score(&self, signals: &UserSignals) -> f64 {
        blended_smart_score(&self.blend(), signals)
    }

    pub fn metric_value(&self, metric: Metric, signals: &UserSignals) -> f64 {
        match metric {
            Metric::Xp => signals.xp as f64,
            Metric::Coins => signals.coins as f64,
            Metric::Earnings => signals.earned,
            Metric::Referrals => signals.referrals as f64,
            Metric::SmartScore => self.smart_score(signals),
        }
    }

    pub fn badges(&self, signals: &UserSignals) -> Vec<Badge> {
        let mut badges = Vec::new();

        if signals.referrals >= FIRST_REFERRAL {
            badges.push(Badge::FirstReferral);
        }
        if signals.referrals >= NETWORK_BUILDER_REFERRALS {
            badges.push(Badge::NetworkBuilder);
        }
        if signals.streak_days >= WEEK_STREAK_DAYS {
            badges.push(Badge::WeekStreak);
        }
        if signals.streak_days >= MONTH_STREAK_DAYS {
            badges.push(Badge::MonthStreak);
        }
        if signals.earned > 0.0 {
            badges.push(Badge::FirstEarning);
        }
        if signals.earned >= HIGH_EARNER_TOTAL {
            badges.push(Badge::HighEarner);
        }

        badges.extend(
            self.ranks
                .reached(signals.xp)
                .filter(|tier| *tier != RankTier::Newbie)
                .map(Badge::Rank),
        );

        badges
    }
}

/// `1000 · trust · Σ wᵢ · norm(vᵢ)` over a blend from [`ScoreConfig::blend`].
pub fn blended_smart_score(blend: &[(f64, f64); 4], signals: &UserSignals) -> f64 {
    let values = [
        signals.xp as f64,
        signals.earned,
        signals.referrals as f64,
        signals.streak_days as f64,
    ];

    let weighted: f64 = blend
        .iter()
        .zip(values)
        .map(|(&(weight, cap), value)| weight * normalise(value, cap))
        .sum();

    let trust = TrustState {
        trust_score: signals.trust_score,
        is_shadow_banned: signals.is_shadow_banned,
    };

    round_to(SMART_SCORE_SCALE * trust.multiplier() * weighted, 2)
}

fn normalise(value: f64, cap: f64) -> f64 {
    let value = value.max(0.0);
    if cap <= 0.0 {
        return if value > 0.0 { 1.0 } else { 0.0 };
    }

    (value.ln_1p() / cap.ln_1p()).min(1.0)
}

fn round_to(value: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (value * scale).round() / scale
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Badge {
    FirstReferral,
    NetworkBuilder,
    WeekStreak,
    MonthStreak,
    FirstEarning,
    HighEarner,
    Rank(RankTier),
}

impl fmt::Display for Badge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Badge::FirstReferral => f.write_str("first_referral"),
            Badge::NetworkBuilder => f.write_str("network_builder"),
            Badge::WeekStreak => f.write_str("week_streak"),
            Badge::MonthStreak => f.write_str("month_streak"),
            Badge::FirstEarning => f.write_str("first_earning"),
            Badge::HighEarner => f.write_str("high_earner"),
            Badge::Rank(tier) => write!(f, "rank_{}", tier.as_str().to_ascii_lowercase()),
        }
    }
}

impl Serialize for Badge {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GamificationStats {
    pub xp: i64,
    pub rank: RankTier,
    #[serde(rename = "nextRankXP")]
    pub next_rank_xp: Option<i64>,
    pub progress_pct: f64,
    pub streak_days: i64,
    pub smart_score: f64,
    pub badges: Vec<Badge>,
}

/// Derives progression and the smart score from a user's durable counters on every read.
pub struct ScoreEngine {
    activity: Arc<dyn ActivityStore>,
    trust: Arc<TrustEngine>,
    config: ScoreConfig,
    timeout: Duration,
}

impl ScoreEngine {
    pub fn new(
        activity: Arc<dyn ActivityStore>,
        trust: Arc<TrustEngine>,
        config: ScoreConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            activity,
            trust,
            config,
            timeout,
        }
    }

    pub fn config(&self) -> &ScoreConfig {
        &self.config
    }

    /// All-time signals: the snapshot counters joined with the user's trust state. Users
    /// without a row get zeros.
    async fn current_signals(&self, user_id: &UserId) -> StoreResult<UserSignals> {
        let (snapshot, trust) = tokio::try_join!(
            with_deadline(self.timeout, self.activity.snapshot(user_id)),
            self.trust.get_trust_state(user_id),
        )?;

        let snapshot = snapshot.unwrap_or_else(|| ActivitySnapshot::empty(user_id.clone()));

        Ok(UserSignals {
            trust_score: trust.trust_score,
            is_shadow_banned: trust.is_shadow_banned,
            ..UserSignals::from(&snapshot)
        })
    }

    #[instrument(skip(self))]
    pub async fn calculate_smart_score(&self, user_id: &UserId) -> StoreResult<f64> {
        let signals = self.current_signals(user_id).await?;
        Ok(self.config.smart_score(&signals))
    }

    #[instrument(skip(self))]
    pub async fn get_gamification_stats(&self, user_id: &UserId) -> StoreResult<GamificationStats> {
        let signals = self.current_signals(user_id).await?;
        let progress = self.config.ranks.progress(signals.xp);

        Ok(GamificationStats {
            xp: signals.xp,
            rank: progress.tier,
            next_rank_xp: progress.next_rank_xp,
            progress_pct: progress.progress_pct,
            streak_days: signals.streak_days,
            smart_score: self.config.smart_score(&signals),
            badges: self.config.badges(&signals),
        })
    }
}

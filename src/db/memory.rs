//! In-process implementations of the store traits, used by engine and route tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::StoreResult;
use crate::db::models::activity::{ActivitySnapshot, UserId, UserSignals};
use crate::db::models::leaderboard::{AheadQuery, Board, BoardEntry, Metric, ScoredUser};
use crate::db::models::trust::{FraudEvent, NewFraudEvent, TrustRecord};
use crate::db::redis::{
    CacheError, CacheResult, LeaderboardCache, Lease, MemberLookup, WindowOutcome, WindowStore,
};
use crate::db::repositories::{ActivityStore, TrustStore};
use crate::engine::score::{ScoreConfig, blended_smart_score};

fn unreachable_cache() -> CacheError {
    CacheError::RedisClientError(redis::RedisError::from((
        redis::ErrorKind::IoError,
        "connection refused",
    )))
}

/// Stands in for a backend that accepted the call and never answers.
async fn stall_if(stalled: &AtomicBool) {
    if stalled.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}

#[derive(Debug, Clone)]
struct LedgerRow {
    user_id: UserId,
    xp: i64,
    coins: i64,
    earned: f64,
    at: DateTime<Utc>,
}

/// Users, ledger and referrals. Trust columns are joined from the shared [`MemoryTrustStore`].
#[derive(Default)]
pub struct MemoryActivityStore {
    users: Mutex<BTreeMap<UserId, ActivitySnapshot>>,
    ledger: Mutex<Vec<LedgerRow>>,
    referrals: Mutex<Vec<(UserId, DateTime<Utc>)>>,
    trust: Arc<MemoryTrustStore>,
    stalled: AtomicBool,
    page_calls: AtomicUsize,
}

impl MemoryActivityStore {
    pub fn new(trust: Arc<MemoryTrustStore>) -> Self {
        Self {
            trust,
            ..Default::default()
        }
    }

    pub fn insert_user(&self, snapshot: ActivitySnapshot) {
        self.users
            .lock()
            .unwrap()
            .insert(snapshot.user_id.clone(), snapshot);
    }

    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Number of `signals_page` calls served so far.
    pub fn page_calls(&self) -> usize {
        self.page_calls.load(Ordering::SeqCst)
    }

    /// Adds a ledger row and bumps the user's all-time counters to match.
    pub fn record_activity(
        &self,
        user_id: &str,
        xp: i64,
        coins: i64,
        earned: f64,
        at: DateTime<Utc>,
    ) {
        let user_id = UserId::from(user_id);
        {
            let mut users = self.users.lock().unwrap();
            let user = users
                .entry(user_id.clone())
                .or_insert_with(|| ActivitySnapshot::empty(user_id.clone()));
            user.xp += xp;
            user.coins += coins;
            user.total_earned += earned;
        }

        self.ledger.lock().unwrap().push(LedgerRow {
            user_id,
            xp,
            coins,
            earned,
            at,
        });
    }

    pub fn record_referral(&self, referrer: &str, verified_at: DateTime<Utc>) {
        let referrer = UserId::from(referrer);
        {
            let mut users = self.users.lock().unwrap();
            let user = users
                .entry(referrer.clone())
                .or_insert_with(|| ActivitySnapshot::empty(referrer.clone()));
            user.referral_count += 1;
        }

        self.referrals.lock().unwrap().push((referrer, verified_at));
    }

    fn signals_for(
        &self,
        snapshot: &ActivitySnapshot,
        since: Option<DateTime<Utc>>,
    ) -> UserSignals {
        let mut signals = UserSignals::from(snapshot);

        if let Some(since) = since {
            let ledger = self.ledger.lock().unwrap();
            let rows = ledger
                .iter()
                .filter(|r| r.user_id == snapshot.user_id && r.at >= since);

            (signals.xp, signals.coins, signals.earned) = rows.fold((0, 0, 0.0), |acc, r| {
                (acc.0 + r.xp, acc.1 + r.coins, acc.2 + r.earned)
            });

            signals.referrals = self
                .referrals
                .lock()
                .unwrap()
                .iter()
                .filter(|(id, at)| *id == snapshot.user_id && *at >= since)
                .count() as i64;
        }

        if let Some(record) = self.trust.records.lock().unwrap().get(&snapshot.user_id) {
            signals.trust_score = record.trust_score;
            signals.is_shadow_banned = record.is_shadow_banned;
        }

        signals
    }
}

#[async_trait]
impl ActivityStore for MemoryActivityStore {
    async fn snapshot(&self, user_id: &UserId) -> StoreResult<Option<ActivitySnapshot>> {
        stall_if(&self.stalled).await;
        Ok(self.users.lock().unwrap().get(user_id).cloned())
    }

    async fn signals(
        &self,
        user_id: &UserId,
        since: Option<DateTime<Utc>>,
    ) -> StoreResult<Option<UserSignals>> {
        stall_if(&self.stalled).await;
        let snapshot = self.users.lock().unwrap().get(user_id).cloned();
        Ok(snapshot.map(|s| self.signals_for(&s, since)))
    }

    async fn signals_page(
        &self,
        since: Option<DateTime<Utc>>,
        after: Option<&UserId>,
        limit: i64,
    ) -> StoreResult<Vec<UserSignals>> {
        stall_if(&self.stalled).await;
        self.page_calls.fetch_add(1, Ordering::SeqCst);

        let page: Vec<ActivitySnapshot> = self
            .users
            .lock()
            .unwrap()
            .values()
            .filter(|s| after.is_none_or(|after| s.user_id > *after))
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect();

        Ok(page.iter().map(|s| self.signals_for(s, since)).collect())
    }

    async fn count_ahead(&self, query: &AheadQuery<'_>) -> StoreResult<u64> {
        stall_if(&self.stalled).await;

        let config = ScoreConfig::default();
        let users: Vec<ActivitySnapshot> = self.users.lock().unwrap().values().cloned().collect();

        let ahead = users
            .iter()
            .map(|s| self.signals_for(s, query.since))
            .filter(|s| !s.is_shadow_banned && s.user_id != *query.user_id)
            .filter(|s| {
                let value = match query.metric {
                    Metric::SmartScore => blended_smart_score(&query.blend, s),
                    metric => config.metric_value(metric, s),
                };
                value > query.score || (value == query.score && s.user_id < *query.user_id)
            })
            .count();

        Ok(ahead as u64)
    }
}

#[derive(Default)]
pub struct MemoryTrustStore {
    records: Mutex<HashMap<UserId, TrustRecord>>,
    events: Mutex<Vec<FraudEvent>>,
    next_id: AtomicI64,
    stalled: AtomicBool,
}

impl MemoryTrustStore {
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    pub fn set_record(&self, record: TrustRecord) {
        self.records
            .lock()
            .unwrap()
            .insert(record.user_id.clone(), record);
    }

    fn apply(&self, user_id: &UserId, delta: i32) -> TrustRecord {
        let mut records = self.records.lock().unwrap();
        let current = records
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| TrustRecord::fresh(user_id.clone()));

        let next = current.apply_delta(delta, Utc::now());
        records.insert(user_id.clone(), next.clone());
        next
    }
}

#[async_trait]
impl TrustStore for MemoryTrustStore {
    async fn trust_record(&self, user_id: &UserId) -> StoreResult<Option<TrustRecord>> {
        stall_if(&self.stalled).await;
        Ok(self.records.lock().unwrap().get(user_id).cloned())
    }

    async fn record_fraud_event(&self, event: &NewFraudEvent) -> StoreResult<TrustRecord> {
        stall_if(&self.stalled).await;
        self.events.lock().unwrap().push(FraudEvent {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            user_id: event.user_id.clone(),
            kind: event.kind.clone(),
            severity: event.severity,
            score_impact: event.score_impact(),
            details: event.details.clone(),
            metadata: event.metadata.clone(),
            created_at: Utc::now(),
        });

        Ok(self.apply(&event.user_id, event.score_impact()))
    }

    async fn adjust_trust(&self, user_id: &UserId, delta: i32) -> StoreResult<TrustRecord> {
        stall_if(&self.stalled).await;
        Ok(self.apply(user_id, delta))
    }

    async fn fraud_events(&self, user_id: &UserId, limit: i64) -> StoreResult<Vec<FraudEvent>> {
        stall_if(&self.stalled).await;
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .rev()
            .filter(|e| e.user_id == *user_id)
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }
}

/// Leaderboard cache with switches for an unreachable or stalled backend.
#[derive(Default)]
pub struct MemoryCache {
    boards: Mutex<HashMap<Board, Vec<ScoredUser>>>,
    leases: Mutex<HashMap<Board, String>>,
    failing: AtomicBool,
    stalled: AtomicBool,
    stalled_writes: AtomicBool,
}

impl MemoryCache {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Stalls only `replace_board`, so leases are taken but never released by the writer.
    pub fn set_stalled_writes(&self, stalled: bool) {
        self.stalled_writes.store(stalled, Ordering::SeqCst);
    }

    pub fn hold_lease(&self, board: Board) {
        self.leases
            .lock()
            .unwrap()
            .insert(board, String::from("held-elsewhere"));
    }

    pub fn is_leased(&self, board: Board) -> bool {
        self.leases.lock().unwrap().contains_key(&board)
    }

    pub fn board(&self, board: Board) -> Option<Vec<ScoredUser>> {
        self.boards.lock().unwrap().get(&board).cloned()
    }

    async fn check(&self) -> CacheResult<()> {
        stall_if(&self.stalled).await;

        if self.failing.load(Ordering::SeqCst) {
            return Err(unreachable_cache());
        }

        Ok(())
    }
}

#[async_trait]
impl LeaderboardCache for MemoryCache {
    async fn top(&self, board: Board, limit: usize) -> CacheResult<Option<Vec<BoardEntry>>> {
        self.check().await?;

        Ok(self.boards.lock().unwrap().get(&board).map(|entries| {
            entries
                .iter()
                .take(limit)
                .zip(1u64..)
                .map(|(e, rank)| BoardEntry {
                    user_id: e.user_id.clone(),
                    score: e.score,
                    rank,
                })
                .collect()
        }))
    }

    async fn member(&self, board: Board, user_id: &UserId) -> CacheResult<MemberLookup> {
        self.check().await?;

        let boards = self.boards.lock().unwrap();
        let Some(entries) = boards.get(&board) else {
            return Ok(MemberLookup::Cold);
        };

        Ok(entries
            .iter()
            .zip(1u64..)
            .find(|(e, _)| e.user_id == *user_id)
            .map_or(MemberLookup::Absent, |(e, rank)| MemberLookup::Present {
                rank,
                score: e.score,
            }))
    }

    async fn replace_board(&self, board: Board, entries: &[ScoredUser]) -> CacheResult<()> {
        self.check().await?;
        stall_if(&self.stalled_writes).await;
        self.boards.lock().unwrap().insert(board, entries.to_vec());
        Ok(())
    }

    async fn try_lease(&self, board: Board, _ttl: Duration) -> CacheResult<Option<Lease>> {
        self.check().await?;

        let mut leases = self.leases.lock().unwrap();
        if leases.contains_key(&board) {
            return Ok(None);
        }

        let token = uuid::Uuid::new_v4().to_string();
        leases.insert(board, token.clone());
        Ok(Some(Lease { board, token }))
    }

    async fn release(&self, lease: &Lease) -> CacheResult<()> {
        let mut leases = self.leases.lock().unwrap();
        if leases.get(&lease.board) == Some(&lease.token) {
            leases.remove(&lease.board);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryWindowStore {
    windows: Mutex<HashMap<String, Vec<i64>>>,
    failing: AtomicBool,
}

impl MemoryWindowStore {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn admit(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        limit: u64,
    ) -> CacheResult<WindowOutcome> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(unreachable_cache());
        }

        let mut windows = self.windows.lock().unwrap();
        let log = windows.entry(key.to_string()).or_default();

        log.retain(|at| *at > now_ms - window_ms);
        log.sort_unstable();

        let count = log.len() as u64;
        let oldest_ms = log.first().copied();

        if count >= limit {
            return Ok(WindowOutcome {
                admitted: false,
                count,
                oldest_ms,
            });
        }

        log.push(now_ms);
        Ok(WindowOutcome {
            admitted: true,
            count,
            oldest_ms,
        })
    }
}

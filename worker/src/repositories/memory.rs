use std::collections::{HashMap, HashSet};

use alert_engine::is_eligible;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use domain::{Alert, AlertHistoryEntry, PriceHistoryPoint, YieldPoolSnapshot};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{AlertRepository, PriceHistoryRepository, TokenRepository, YieldPoolRepository};
use crate::error::{RepoResult, RepositoryError};

/// Repository operations that can be made to fail on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ListTrackedTokens,
    ListTrackedPools,
    UpsertTokenPrice,
    UpsertYieldPool,
    ListEligibleAlerts,
    InsertAlertHistory,
    MarkAlertTriggered,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredTokenPrice {
    pub price_usd: f64,
    pub change_24h: Option<f64>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredPool {
    pub snapshot: YieldPoolSnapshot,
    pub updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct MemoryState {
    tracked_tokens: Vec<String>,
    tracked_pools: Vec<String>,
    token_prices: HashMap<String, StoredTokenPrice>,
    pools: HashMap<String, StoredPool>,
    alerts: Vec<Alert>,
    history: Vec<AlertHistoryEntry>,
    price_history: Vec<PriceHistoryPoint>,
    failing: HashSet<Operation>,
    failing_token_ids: HashSet<String>,
}

impl MemoryState {
    fn check(&self, op: Operation) -> RepoResult<()> {
        if self.failing.contains(&op) {
            Err(RepositoryError::Unavailable(format!("{op:?} failed")))
        } else {
            Ok(())
        }
    }
}

/// Process-local store backing every repository trait; used by tests and
/// dry runs without a database.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn track_token(&self, id: &str) {
        let mut state = self.state.lock().await;
        if !state.tracked_tokens.iter().any(|t| t == id) {
            state.tracked_tokens.push(id.to_string());
        }
    }

    pub async fn track_pool(&self, pool_id: &str) {
        let mut state = self.state.lock().await;
        if !state.tracked_pools.iter().any(|p| p == pool_id) {
            state.tracked_pools.push(pool_id.to_string());
        }
    }

    pub async fn insert_alert(&self, alert: Alert) {
        self.state.lock().await.alerts.push(alert);
    }

    pub async fn fail(&self, op: Operation) {
        self.state.lock().await.failing.insert(op);
    }

    pub async fn recover(&self, op: Operation) {
        self.state.lock().await.failing.remove(&op);
    }

    /// Makes `upsert_token_price` fail for one id only.
    pub async fn fail_token_upsert(&self, id: &str) {
        self.state.lock().await.failing_token_ids.insert(id.to_string());
    }

    pub async fn token_price(&self, id: &str) -> Option<StoredTokenPrice> {
        self.state.lock().await.token_prices.get(id).cloned()
    }

    pub async fn pool(&self, pool_id: &str) -> Option<StoredPool> {
        self.state.lock().await.pools.get(pool_id).cloned()
    }

    pub async fn alert(&self, id: Uuid) -> Option<Alert> {
        let state = self.state.lock().await;
        state.alerts.iter().find(|a| a.id == id).cloned()
    }

    pub async fn history(&self) -> Vec<AlertHistoryEntry> {
        self.state.lock().await.history.clone()
    }

    pub async fn price_history(&self) -> Vec<PriceHistoryPoint> {
        self.state.lock().await.price_history.clone()
    }
}

#[async_trait]
impl TokenRepository for InMemoryStore {
    async fn list_tracked_token_ids(&self) -> RepoResult<Vec<String>> {
        let state = self.state.lock().await;
        state.check(Operation::ListTrackedTokens)?;
        Ok(state.tracked_tokens.clone())
    }

    async fn upsert_token_price(
        &self,
        id: &str,
        price_usd: f64,
        change_24h: Option<f64>,
    ) -> RepoResult<()> {
        let mut state = self.state.lock().await;
        state.check(Operation::UpsertTokenPrice)?;
        if state.failing_token_ids.contains(id) {
            return Err(RepositoryError::Unavailable(format!("upsert {id} failed")));
        }
        state.token_prices.insert(
            id.to_string(),
            StoredTokenPrice {
                price_usd,
                change_24h,
                last_updated: Utc::now(),
            },
        );
        Ok(())
    }

    async fn token_price_usd(&self, id: &str) -> RepoResult<Option<f64>> {
        let state = self.state.lock().await;
        Ok(state.token_prices.get(id).map(|p| p.price_usd))
    }
}

#[async_trait]
impl YieldPoolRepository for InMemoryStore {
    async fn list_tracked_pool_ids(&self) -> RepoResult<Vec<String>> {
        let state = self.state.lock().await;
        state.check(Operation::ListTrackedPools)?;
        Ok(state.tracked_pools.clone())
    }

    async fn upsert_yield_pool(&self, snapshot: &YieldPoolSnapshot) -> RepoResult<()> {
        let mut state = self.state.lock().await;
        state.check(Operation::UpsertYieldPool)?;
        state.pools.insert(
            snapshot.pool_id.clone(),
            StoredPool {
                snapshot: snapshot.clone(),
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn pool_apy(&self, pool_id: &str) -> RepoResult<Option<f64>> {
        let state = self.state.lock().await;
        Ok(state.pools.get(pool_id).map(|p| p.snapshot.apy))
    }
}

#[async_trait]
impl AlertRepository for InMemoryStore {
    async fn list_eligible_alerts(
        &self,
        now: DateTime<Utc>,
        cooldown: ChronoDuration,
    ) -> RepoResult<Vec<Alert>> {
        let state = self.state.lock().await;
        state.check(Operation::ListEligibleAlerts)?;
        let mut alerts: Vec<Alert> = state
            .alerts
            .iter()
            .filter(|alert| is_eligible(alert, now, cooldown))
            .cloned()
            .collect();
        alerts.sort_by_key(|alert| (alert.created_at, alert.id));
        Ok(alerts)
    }

    async fn insert_alert_history(&self, entry: &AlertHistoryEntry) -> RepoResult<()> {
        let mut state = self.state.lock().await;
        state.check(Operation::InsertAlertHistory)?;
        state.history.push(entry.clone());
        Ok(())
    }

    async fn mark_alert_triggered(&self, alert_id: Uuid, now: DateTime<Utc>) -> RepoResult<bool> {
        let mut state = self.state.lock().await;
        state.check(Operation::MarkAlertTriggered)?;
        match state.alerts.iter_mut().find(|a| a.id == alert_id) {
            Some(alert) => {
                alert.last_triggered_at = Some(now);
                alert.trigger_count += 1;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl PriceHistoryRepository for InMemoryStore {
    async fn upsert_points(&self, points: &[PriceHistoryPoint]) -> RepoResult<()> {
        let mut state = self.state.lock().await;
        for point in points {
            state
                .price_history
                .retain(|p| !(p.symbol == point.symbol && p.price_ts == point.price_ts));
            state.price_history.push(point.clone());
        }
        Ok(())
    }

    async fn latest_timestamp(&self, symbol: &str) -> RepoResult<Option<DateTime<Utc>>> {
        let state = self.state.lock().await;
        Ok(state
            .price_history
            .iter()
            .filter(|p| p.symbol == symbol)
            .map(|p| p.price_ts)
            .max())
    }
}

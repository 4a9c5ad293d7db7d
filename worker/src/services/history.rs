use std::sync::Arc;

use domain::PriceHistoryPoint;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    cancel::CancelToken,
    clients::PriceSource,
    error::{FetchError, JobError},
    repositories::PriceHistoryRepository,
};

const HISTORY_SOURCE: &str = "coingecko";

/// Pulls market-chart history for a symbol and stores the points newer than
/// what is already persisted.
pub struct HistoryBackfill<P, H>
where
    P: PriceSource + 'static,
    H: PriceHistoryRepository + 'static,
{
    source: Arc<P>,
    repo: Arc<H>,
}

impl<P, H> HistoryBackfill<P, H>
where
    P: PriceSource + 'static,
    H: PriceHistoryRepository + 'static,
{
    pub fn new(source: Arc<P>, repo: Arc<H>) -> Self {
        Self { source, repo }
    }

    /// Returns the number of points written. `symbol` is stored upper-cased.
    pub async fn backfill(
        &self,
        ctx: &CancelToken,
        symbol: &str,
        coin_id: &str,
        days: u32,
    ) -> Result<usize, JobError> {
        let symbol = symbol.trim().to_uppercase();
        let latest = self.repo.latest_timestamp(&symbol).await?;
        let fetched = match self.source.fetch_price_history(ctx, coin_id, days).await {
            Ok(points) => points,
            Err(FetchError::Cancelled) => return Err(JobError::Cancelled),
            Err(err) => return Err(err.into()),
        };
        let total = fetched.len();
        let points: Vec<PriceHistoryPoint> = fetched
            .into_iter()
            .filter(|p| latest.map_or(true, |ts| p.timestamp > ts))
            .map(|p| PriceHistoryPoint {
                id: Uuid::new_v4(),
                symbol: symbol.clone(),
                price: p.price,
                price_ts: p.timestamp,
                source: HISTORY_SOURCE.to_string(),
            })
            .collect();
        debug!(%symbol, fetched = total, new = points.len(), "history window fetched");
        self.repo.upsert_points(&points).await?;
        info!(%symbol, days, points = points.len(), "price history synced");
        Ok(points.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use domain::{PricePoint, TokenPrice};

    use crate::{cancel::CancelSource, repositories::InMemoryStore};

    struct FixedHistory(Vec<PricePoint>);

    #[async_trait]
    impl PriceSource for FixedHistory {
        async fn fetch_token_prices(
            &self,
            _ctx: &CancelToken,
            _ids: &[String],
        ) -> Result<HashMap<String, TokenPrice>, FetchError> {
            Ok(HashMap::new())
        }

        async fn fetch_price_history(
            &self,
            _ctx: &CancelToken,
            _id: &str,
            _days: u32,
        ) -> Result<Vec<PricePoint>, FetchError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn only_points_after_latest_are_written() {
        let at = |h| Utc.with_ymd_and_hms(2024, 5, 1, h, 0, 0).unwrap();
        let source = Arc::new(FixedHistory(vec![
            PricePoint { timestamp: at(0), price: 1.0 },
            PricePoint { timestamp: at(1), price: 2.0 },
            PricePoint { timestamp: at(2), price: 3.0 },
        ]));
        let store = Arc::new(InMemoryStore::new());
        store
            .upsert_points(&[PriceHistoryPoint {
                id: Uuid::new_v4(),
                symbol: "ETH".into(),
                price: 1.0,
                price_ts: at(1),
                source: HISTORY_SOURCE.into(),
            }])
            .await
            .unwrap();

        let backfill = HistoryBackfill::new(source, store.clone());
        let written = backfill
            .backfill(&CancelSource::new().token(), "eth", "ethereum", 1)
            .await
            .unwrap();
        assert_eq!(written, 1);
        assert_eq!(store.price_history().await.len(), 2);
    }
}

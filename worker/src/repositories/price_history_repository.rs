use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::PriceHistoryPoint;
use sqlx::{PgPool, Row};

use crate::error::RepoResult;

#[async_trait]
pub trait PriceHistoryRepository: Send + Sync {
    async fn upsert_points(&self, points: &[PriceHistoryPoint]) -> RepoResult<()>;
    async fn latest_timestamp(&self, symbol: &str) -> RepoResult<Option<DateTime<Utc>>>;
}

#[derive(Clone)]
pub struct PostgresPriceHistoryRepository {
    pool: PgPool,
}

impl PostgresPriceHistoryRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PriceHistoryRepository for PostgresPriceHistoryRepository {
    async fn upsert_points(&self, points: &[PriceHistoryPoint]) -> RepoResult<()> {
        if points.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for p in points {
            sqlx::query(
                "INSERT INTO price_history (id, symbol, price, price_ts, source)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (symbol, price_ts) DO UPDATE
                 SET price = EXCLUDED.price, source = EXCLUDED.source",
            )
            .bind(p.id)
            .bind(&p.symbol)
            .bind(p.price)
            .bind(p.price_ts)
            .bind(&p.source)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn latest_timestamp(&self, symbol: &str) -> RepoResult<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT price_ts FROM price_history WHERE symbol = $1 ORDER BY price_ts DESC LIMIT 1",
        )
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(row.try_get("price_ts")?)),
            None => Ok(None),
        }
    }
}

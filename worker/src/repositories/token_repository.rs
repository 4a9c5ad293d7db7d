use async_trait::async_trait;
use sqlx::{PgPool, Row};

use crate::error::{RepoResult, RepositoryError};

#[async_trait]
pub trait TokenRepository: Send + Sync {
    /// CoinGecko ids of every tracked token, in insertion order.
    async fn list_tracked_token_ids(&self) -> RepoResult<Vec<String>>;
    /// Sets `price_usd`, `price_change_24h` and bumps `last_updated`.
    async fn upsert_token_price(
        &self,
        id: &str,
        price_usd: f64,
        change_24h: Option<f64>,
    ) -> RepoResult<()>;
    async fn token_price_usd(&self, id: &str) -> RepoResult<Option<f64>>;
}

#[derive(Clone)]
pub struct PostgresTokenRepository {
    pool: PgPool,
}

impl PostgresTokenRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TokenRepository for PostgresTokenRepository {
    async fn list_tracked_token_ids(&self) -> RepoResult<Vec<String>> {
        let rows = sqlx::query(
            "SELECT coingecko_id FROM tokens
             WHERE is_tracked
             ORDER BY created_at ASC, coingecko_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| row.try_get::<String, _>("coingecko_id").map_err(RepositoryError::from))
            .collect()
    }

    async fn upsert_token_price(
        &self,
        id: &str,
        price_usd: f64,
        change_24h: Option<f64>,
    ) -> RepoResult<()> {
        sqlx::query(
            "INSERT INTO tokens (coingecko_id, price_usd, price_change_24h, last_updated)
             VALUES ($1, $2, $3, NOW())
             ON CONFLICT (coingecko_id) DO UPDATE
             SET price_usd = EXCLUDED.price_usd,
                 price_change_24h = EXCLUDED.price_change_24h,
                 last_updated = NOW()",
        )
        .bind(id)
        .bind(price_usd)
        .bind(change_24h)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn token_price_usd(&self, id: &str) -> RepoResult<Option<f64>> {
        let row = sqlx::query("SELECT price_usd FROM tokens WHERE coingecko_id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(row.try_get::<Option<f64>, _>("price_usd")?),
            None => Ok(None),
        }
    }
}

use async_trait::async_trait;
use domain::YieldPoolSnapshot;
use sqlx::{PgPool, Row};

use crate::error::{RepoResult, RepositoryError};

#[async_trait]
pub trait YieldPoolRepository: Send + Sync {
    async fn list_tracked_pool_ids(&self) -> RepoResult<Vec<String>>;
    /// Keyed by `pool_id`; overwrites every metric field and bumps `updated_at`.
    async fn upsert_yield_pool(&self, snapshot: &YieldPoolSnapshot) -> RepoResult<()>;
    async fn pool_apy(&self, pool_id: &str) -> RepoResult<Option<f64>>;
}

#[derive(Clone)]
pub struct PostgresYieldPoolRepository {
    pool: PgPool,
}

impl PostgresYieldPoolRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl YieldPoolRepository for PostgresYieldPoolRepository {
    async fn list_tracked_pool_ids(&self) -> RepoResult<Vec<String>> {
        let rows = sqlx::query(
            "SELECT pool_id FROM yield_pools
             WHERE is_tracked AND is_active
             ORDER BY created_at ASC, pool_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| row.try_get::<String, _>("pool_id").map_err(RepositoryError::from))
            .collect()
    }

    async fn upsert_yield_pool(&self, snapshot: &YieldPoolSnapshot) -> RepoResult<()> {
        sqlx::query(
            "INSERT INTO yield_pools (
                pool_id, protocol, chain, symbol, tvl_usd, apy, apy_base, apy_reward,
                il_7d, is_stable, updated_at
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
             ON CONFLICT (pool_id) DO UPDATE
             SET protocol = EXCLUDED.protocol,
                 chain = EXCLUDED.chain,
                 symbol = EXCLUDED.symbol,
                 tvl_usd = EXCLUDED.tvl_usd,
                 apy = EXCLUDED.apy,
                 apy_base = EXCLUDED.apy_base,
                 apy_reward = EXCLUDED.apy_reward,
                 il_7d = EXCLUDED.il_7d,
                 is_stable = EXCLUDED.is_stable,
                 updated_at = NOW()",
        )
        .bind(&snapshot.pool_id)
        .bind(&snapshot.protocol)
        .bind(&snapshot.chain)
        .bind(&snapshot.symbol)
        .bind(snapshot.tvl_usd)
        .bind(snapshot.apy)
        .bind(snapshot.apy_base)
        .bind(snapshot.apy_reward)
        .bind(snapshot.il_7d)
        .bind(snapshot.is_stable)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pool_apy(&self, pool_id: &str) -> RepoResult<Option<f64>> {
        let row = sqlx::query("SELECT apy FROM yield_pools WHERE pool_id = $1")
            .bind(pool_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(row.try_get::<Option<f64>, _>("apy")?),
            None => Ok(None),
        }
    }
}

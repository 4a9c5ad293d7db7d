use std::env;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use serde_json::json;
use sqlx::{postgres::PgPoolOptions, PgPool};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let database_url = env::var("DATABASE_URL").context("DATABASE_URL is not set")?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await?;

    sqlx::migrate!("../migrations").run(&pool).await?;

    let webhook = env::var("DEV_SEED_WEBHOOK_URL")
        .unwrap_or_else(|_| "http://localhost:9000/alerts".to_string());
    seed_demo(&pool, &webhook).await?;
    println!("Seeded tracked tokens, pools and demo alerts (dev only).");
    Ok(())
}

async fn seed_demo(pool: &PgPool, webhook: &str) -> Result<()> {
    let user_id = Uuid::new_v5(&Uuid::NAMESPACE_OID, b"defi-worker-dev-user");
    let mut tx = pool.begin().await?;

    // Re-running the seed resets the demo user's alerts to a known state.
    sqlx::query("DELETE FROM alerts WHERE user_id = $1")
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

    for (id, symbol) in [
        ("ethereum", "ETH"),
        ("wrapped-bitcoin", "WBTC"),
        ("usd-coin", "USDC"),
        ("tether", "USDT"),
        ("dai", "DAI"),
    ] {
        sqlx::query(
            "INSERT INTO tokens (coingecko_id, symbol, is_tracked)
             VALUES ($1, $2, TRUE)
             ON CONFLICT (coingecko_id) DO UPDATE SET symbol = EXCLUDED.symbol, is_tracked = TRUE",
        )
        .bind(id)
        .bind(symbol)
        .execute(&mut *tx)
        .await?;
    }

    // point DEV_SEED_POOL_ID at any DefiLlama pool id to track a different one
    let demo_pool = env::var("DEV_SEED_POOL_ID")
        .unwrap_or_else(|_| "aa70268e-4b52-42bf-a116-608b370f9501".to_string());
    let demo_pool = demo_pool.as_str();
    sqlx::query(
        "INSERT INTO yield_pools (pool_id, protocol, chain, symbol, is_stable, is_tracked)
         VALUES ($1, 'aave-v3', 'Ethereum', 'USDC', TRUE, TRUE)
         ON CONFLICT (pool_id) DO UPDATE SET is_tracked = TRUE, is_active = TRUE",
    )
    .bind(demo_pool)
    .execute(&mut *tx)
    .await?;

    let now = Utc::now();
    let alerts = [
        ("price", "ethereum", "above", 2600.0_f64, None),
        ("price", "wrapped-bitcoin", "below", 40_000.0, None),
        ("apr", demo_pool, "below", 4.0, Some(now - Duration::hours(2))),
    ];
    for (offset, (kind, target, comparator, threshold, last)) in alerts.into_iter().enumerate() {
        sqlx::query(
            "INSERT INTO alerts (
                id, user_id, type, status, target, conditions, notification,
                last_triggered_at, trigger_count, created_at
             ) VALUES ($1, $2, $3, 'active', $4, $5, $6, $7, $8, $9)",
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(kind)
        .bind(target)
        .bind(json!({ "comparator": comparator, "threshold": threshold }))
        .bind(json!({ "channel": "webhook", "destination": webhook }))
        .bind(last)
        .bind(if last.is_some() { 1_i64 } else { 0 })
        .bind(now - Duration::minutes(10 - offset as i64))
        .execute(&mut *tx)
        .await?;
    }

    // 30 days of synthetic ETH/USDC history for charts.
    sqlx::query("DELETE FROM price_history WHERE source = 'dev_seed'")
        .execute(&mut *tx)
        .await?;
    for i in 0..30 {
        let ts = now - Duration::days(29 - i);
        let eth_price = 2900.0 + (i as f64 * 25.0);
        for (symbol, price) in [("ETH", eth_price), ("USDC", 1.0_f64)] {
            sqlx::query(
                "INSERT INTO price_history (id, symbol, price, price_ts, source)
                 VALUES ($1, $2, $3, $4, 'dev_seed')
                 ON CONFLICT (symbol, price_ts) DO NOTHING",
            )
            .bind(Uuid::new_v4())
            .bind(symbol)
            .bind(price)
            .bind(ts)
            .execute(&mut *tx)
            .await?;
        }
    }

    tx.commit().await?;
    Ok(())
}

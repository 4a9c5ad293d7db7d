use std::time::Duration;

use worker::{
    bootstrap::build_state, cancel::CancelSource, clients::coingecko::TokenIdMap,
    config::WorkerConfig, telemetry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing()?;
    let config = WorkerConfig::from_env()?;
    let symbols = std::env::var("PRICE_SYMBOLS").unwrap_or_else(|_| "ETH,WBTC,USDC".to_string());
    let days: u32 = std::env::var("PRICE_DAYS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(30);

    let state = build_state(&config).await?;
    let ids = TokenIdMap::new(config.token_price_ids.clone());
    let backfill = state.history_backfill();
    let ctx = CancelSource::new();

    let symbols: Vec<String> = symbols
        .split(',')
        .filter_map(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_uppercase())
            }
        })
        .collect();

    for symbol in symbols {
        let coin_id = ids.resolve(&symbol);
        let token = ctx.token().with_timeout(config.http_timeout * 4);
        if let Err(err) = backfill.backfill(&token, &symbol, &coin_id, days).await {
            tracing::warn!(%symbol, %coin_id, %err, "price history fetch failed");
        }
        // history calls are heavy on the public tier; space them out
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    state.stop_limiters();
    Ok(())
}

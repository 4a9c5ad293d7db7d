use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{PricePoint, TokenPrice};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{send_json, PriceSource};
use crate::{cancel::CancelToken, error::FetchError, rate_limiter::RateLimiter};

const PROVIDER: &str = "coingecko";

/// Read-only symbol → CoinGecko id table. Configured entries win over the
/// built-in defaults; unknown symbols fall back to their lowercase form.
#[derive(Clone, Debug, Default)]
pub struct TokenIdMap {
    ids: HashMap<String, String>,
}

impl TokenIdMap {
    pub fn new(ids: HashMap<String, String>) -> Self {
        Self {
            ids: ids
                .into_iter()
                .map(|(symbol, id)| (symbol.to_uppercase(), id.to_lowercase()))
                .collect(),
        }
    }

    pub fn resolve(&self, symbol: &str) -> String {
        let upper = symbol.trim().to_uppercase();
        if let Some(mapped) = self.ids.get(&upper) {
            return mapped.clone();
        }
        match upper.as_str() {
            "ETH" | "WETH" => "ethereum".to_string(),
            "BTC" => "bitcoin".to_string(),
            "WBTC" => "wrapped-bitcoin".to_string(),
            "USDC" => "usd-coin".to_string(),
            "USDT" => "tether".to_string(),
            "DAI" => "dai".to_string(),
            "BNB" => "binancecoin".to_string(),
            _ => upper.to_lowercase(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CoingeckoClient {
    client: Client,
    api_base: String,
    api_key: Option<String>,
    limiter: RateLimiter,
}

#[derive(Debug, Deserialize)]
struct SimplePriceEntry {
    usd: Option<f64>,
    usd_24h_change: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct MarketChart {
    prices: Vec<(f64, f64)>,
}

impl CoingeckoClient {
    pub fn new(
        api_base: String,
        api_key: Option<String>,
        limiter: RateLimiter,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| FetchError::Transport {
                provider: PROVIDER,
                source,
            })?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            limiter,
        })
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    fn get(&self, path: &str) -> RequestBuilder {
        let request = self.client.get(format!("{}{}", self.api_base, path));
        match &self.api_key {
            // pro keys only work against the pro host, demo keys against the public one
            Some(key) if self.api_base.contains("pro-api") => {
                request.header("x-cg-pro-api-key", key)
            }
            Some(key) => request.header("x-cg-demo-api-key", key),
            None => request,
        }
    }
}

#[async_trait]
impl PriceSource for CoingeckoClient {
    async fn fetch_token_prices(
        &self,
        ctx: &CancelToken,
        ids: &[String],
    ) -> Result<HashMap<String, TokenPrice>, FetchError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let joined = ids.join(",");
        let request = self.get("/simple/price").query(&[
            ("ids", joined.as_str()),
            ("vs_currencies", "usd"),
            ("include_24hr_change", "true"),
        ]);
        let body: HashMap<String, SimplePriceEntry> =
            send_json(PROVIDER, &self.limiter, ctx, request).await?;

        let mut prices = HashMap::with_capacity(body.len());
        for (id, entry) in body {
            match entry.usd {
                Some(usd_price) => {
                    prices.insert(
                        id.clone(),
                        TokenPrice {
                            id,
                            usd_price,
                            change_24h: entry.usd_24h_change,
                        },
                    );
                }
                None => warn!(%id, "coingecko entry without usd price, skipping"),
            }
        }
        debug!(requested = ids.len(), returned = prices.len(), "coingecko prices fetched");
        Ok(prices)
    }

    async fn fetch_price_history(
        &self,
        ctx: &CancelToken,
        id: &str,
        days: u32,
    ) -> Result<Vec<PricePoint>, FetchError> {
        let days = days.max(1).to_string();
        let request = self
            .get(&format!("/coins/{id}/market_chart"))
            .query(&[("vs_currency", "usd"), ("days", days.as_str())]);
        let chart: MarketChart = send_json(PROVIDER, &self.limiter, ctx, request).await?;

        let points = chart
            .prices
            .into_iter()
            .filter_map(|(ts_ms, price)| {
                DateTime::<Utc>::from_timestamp_millis(ts_ms as i64)
                    .map(|timestamp| PricePoint { timestamp, price })
            })
            .collect();
        Ok(points)
    }
}

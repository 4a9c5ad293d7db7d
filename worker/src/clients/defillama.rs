use std::time::Duration;

use async_trait::async_trait;
use domain::{ProtocolTvl, YieldPoolSnapshot};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::{send_json, YieldPoolSource};
use crate::{cancel::CancelToken, error::FetchError, rate_limiter::RateLimiter};

const PROVIDER: &str = "defillama";

/// DefiLlama serves yields and protocol TVL from two hosts; both share one
/// limiter because the ceiling applies per provider.
#[derive(Clone, Debug)]
pub struct DefiLlamaClient {
    client: Client,
    api_base: String,
    yields_base: String,
    api_key: Option<String>,
    limiter: RateLimiter,
}

#[derive(Debug, Deserialize)]
struct PoolsResponse {
    status: String,
    #[serde(default)]
    data: Vec<PoolRow>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PoolRow {
    pool: Option<String>,
    #[serde(default)]
    project: String,
    #[serde(default)]
    chain: String,
    #[serde(default)]
    symbol: String,
    tvl_usd: Option<f64>,
    apy: Option<f64>,
    apy_base: Option<f64>,
    apy_reward: Option<f64>,
    #[serde(rename = "il7d")]
    il_7d: Option<f64>,
    #[serde(default)]
    stablecoin: bool,
}

impl PoolRow {
    fn into_snapshot(self) -> Option<YieldPoolSnapshot> {
        let pool_id = self.pool.filter(|id| !id.is_empty())?;
        let apy = self
            .apy
            .or_else(|| match (self.apy_base, self.apy_reward) {
                (None, None) => None,
                (base, reward) => Some(base.unwrap_or(0.0) + reward.unwrap_or(0.0)),
            })
            .unwrap_or(0.0);
        Some(YieldPoolSnapshot {
            pool_id,
            protocol: self.project,
            chain: self.chain,
            symbol: self.symbol,
            tvl_usd: self.tvl_usd.unwrap_or(0.0),
            apy,
            apy_base: self.apy_base,
            apy_reward: self.apy_reward,
            il_7d: self.il_7d,
            is_stable: self.stablecoin,
        })
    }
}

impl DefiLlamaClient {
    pub fn new(
        api_base: String,
        yields_base: String,
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
            yields_base: yields_base.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            limiter,
        })
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    fn get(&self, url: String) -> RequestBuilder {
        let request = self.client.get(url);
        match &self.api_key {
            Some(key) => request.header("x-api-key", key),
            None => request,
        }
    }
}

#[async_trait]
impl YieldPoolSource for DefiLlamaClient {
    async fn fetch_yield_pools(
        &self,
        ctx: &CancelToken,
    ) -> Result<Vec<YieldPoolSnapshot>, FetchError> {
        let request = self.get(format!("{}/pools", self.yields_base));
        let body: PoolsResponse = send_json(PROVIDER, &self.limiter, ctx, request).await?;
        if body.status != "success" {
            return Err(FetchError::InvalidFormat {
                provider: PROVIDER,
                message: format!("pools status `{}`", body.status),
            });
        }
        let total = body.data.len();
        let pools: Vec<_> = body
            .data
            .into_iter()
            .filter_map(PoolRow::into_snapshot)
            .collect();
        if pools.len() < total {
            warn!(skipped = total - pools.len(), "pool rows without id skipped");
        }
        debug!(pools = pools.len(), "defillama pools fetched");
        Ok(pools)
    }

    async fn fetch_protocol_tvl(
        &self,
        ctx: &CancelToken,
        protocol_slug: &str,
    ) -> Result<ProtocolTvl, FetchError> {
        let request = self.get(format!("{}/protocol/{}", self.api_base, protocol_slug));
        let body: Value = send_json(PROVIDER, &self.limiter, ctx, request).await?;
        parse_protocol_tvl(protocol_slug, &body)
    }
}

/// `tvl` is either a plain number or a daily series whose last entry carries
/// `totalLiquidityUSD`. Anything else is reported, never unwrapped.
fn parse_protocol_tvl(slug: &str, body: &Value) -> Result<ProtocolTvl, FetchError> {
    let invalid = |message: String| FetchError::InvalidFormat {
        provider: PROVIDER,
        message,
    };
    let name = body
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or(slug)
        .to_string();
    let tvl = match body.get("tvl") {
        Some(Value::Number(number)) => number.as_f64(),
        Some(Value::Array(series)) => series
            .last()
            .and_then(|point| point.get("totalLiquidityUSD"))
            .and_then(Value::as_f64),
        Some(_) => None,
        None => return Err(invalid(format!("protocol {slug} has no tvl field"))),
    };
    let tvl = tvl.ok_or_else(|| invalid(format!("protocol {slug} tvl is not numeric")))?;
    Ok(ProtocolTvl { name, tvl })
}

pub mod coingecko;
pub mod defillama;

use std::collections::HashMap;

use async_trait::async_trait;
use domain::{PricePoint, ProtocolTvl, TokenPrice, YieldPoolSnapshot};
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;

use crate::{cancel::CancelToken, error::FetchError, rate_limiter::RateLimiter};

pub use coingecko::CoingeckoClient;
pub use defillama::DefiLlamaClient;

#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn fetch_token_prices(
        &self,
        ctx: &CancelToken,
        ids: &[String],
    ) -> Result<HashMap<String, TokenPrice>, FetchError>;

    async fn fetch_price_history(
        &self,
        ctx: &CancelToken,
        id: &str,
        days: u32,
    ) -> Result<Vec<PricePoint>, FetchError>;
}

#[async_trait]
pub trait YieldPoolSource: Send + Sync {
    async fn fetch_yield_pools(&self, ctx: &CancelToken)
        -> Result<Vec<YieldPoolSnapshot>, FetchError>;

    async fn fetch_protocol_tvl(
        &self,
        ctx: &CancelToken,
        protocol_slug: &str,
    ) -> Result<ProtocolTvl, FetchError>;
}

/// Client-side chain filter over an already fetched pool list.
pub fn filter_pools_by_chain(pools: &[YieldPoolSnapshot], chain: &str) -> Vec<YieldPoolSnapshot> {
    let chain = chain.trim();
    pools
        .iter()
        .filter(|pool| pool.chain.eq_ignore_ascii_case(chain))
        .cloned()
        .collect()
}

/// Shared request path for every upstream call: take a limiter token, send,
/// map non-2xx to `Upstream`, decode JSON. Each await observes `ctx`.
pub(crate) async fn send_json<T>(
    provider: &'static str,
    limiter: &RateLimiter,
    ctx: &CancelToken,
    request: RequestBuilder,
) -> Result<T, FetchError>
where
    T: DeserializeOwned,
{
    limiter.acquire(ctx).await?;
    let response: Response = ctx
        .guard(request.send())
        .await?
        .map_err(|source| FetchError::Transport { provider, source })?;
    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::Upstream { provider, status });
    }
    let body = ctx
        .guard(response.bytes())
        .await?
        .map_err(|source| FetchError::Transport { provider, source })?;
    serde_json::from_slice(&body).map_err(|err| FetchError::Decode {
        provider,
        message: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(id: &str, chain: &str) -> YieldPoolSnapshot {
        YieldPoolSnapshot {
            pool_id: id.to_string(),
            protocol: "aave-v3".to_string(),
            chain: chain.to_string(),
            symbol: "USDC".to_string(),
            tvl_usd: 1_000_000.0,
            apy: 4.2,
            apy_base: Some(4.2),
            apy_reward: None,
            il_7d: None,
            is_stable: true,
        }
    }

    #[test]
    fn filter_by_chain_ignores_case_and_keeps_order() {
        let pools = vec![
            pool("a", "Ethereum"),
            pool("b", "Arbitrum"),
            pool("c", "ethereum"),
        ];
        let filtered = filter_pools_by_chain(&pools, " ETHEREUM ");
        let ids: Vec<_> = filtered.iter().map(|p| p.pool_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert!(filter_pools_by_chain(&pools, "Solana").is_empty());
    }
}

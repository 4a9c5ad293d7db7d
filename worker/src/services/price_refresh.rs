use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::{
    cancel::CancelToken,
    clients::{PriceSource, YieldPoolSource},
    error::{FetchError, JobError},
    repositories::{TokenRepository, YieldPoolRepository},
    scheduler::Job,
};

pub const PRICE_REFRESH_JOB: &str = "price_refresh";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriceRefreshReport {
    pub tracked_tokens: usize,
    pub batches: usize,
    pub failed_batches: usize,
    pub prices_upserted: usize,
    pub price_upserts_failed: usize,
    /// Ids the upstream answered without a usable quote.
    pub missing_prices: usize,
    pub tracked_pools: usize,
    pub pools_upserted: usize,
    pub pool_upserts_failed: usize,
    pub pool_fetch_failed: bool,
}

impl PriceRefreshReport {
    fn made_progress(&self) -> bool {
        self.prices_upserted > 0 || self.pools_upserted > 0
    }

    fn had_fetch_failures(&self) -> bool {
        self.failed_batches > 0 || self.pool_fetch_failed
    }
}

/// One pass fetches every tracked token price in bulk batches and every tracked
/// yield pool, then persists them. Per-batch and per-row failures are counted
/// and skipped. Portfolio balance USD values are recomputed elsewhere, so this
/// job never rewrites balance rows.
pub struct PriceRefresher<P, Y, T, L>
where
    P: PriceSource + 'static,
    Y: YieldPoolSource + 'static,
    T: TokenRepository + 'static,
    L: YieldPoolRepository + 'static,
{
    price_source: Arc<P>,
    pool_source: Arc<Y>,
    token_repo: Arc<T>,
    pool_repo: Arc<L>,
    batch_size: usize,
}

impl<P, Y, T, L> PriceRefresher<P, Y, T, L>
where
    P: PriceSource + 'static,
    Y: YieldPoolSource + 'static,
    T: TokenRepository + 'static,
    L: YieldPoolRepository + 'static,
{
    pub fn new(
        price_source: Arc<P>,
        pool_source: Arc<Y>,
        token_repo: Arc<T>,
        pool_repo: Arc<L>,
        batch_size: usize,
    ) -> Self {
        Self {
            price_source,
            pool_source,
            token_repo,
            pool_repo,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn run_once(&self, ctx: &CancelToken) -> Result<PriceRefreshReport, JobError> {
        let token_ids = self.token_repo.list_tracked_token_ids().await?;
        let mut report = PriceRefreshReport {
            tracked_tokens: token_ids.len(),
            ..Default::default()
        };
        let mut last_error: Option<JobError> = None;

        for (index, batch) in token_ids.chunks(self.batch_size).enumerate() {
            ctx.check()?;
            report.batches += 1;
            let prices = match self.price_source.fetch_token_prices(ctx, batch).await {
                Ok(prices) => prices,
                Err(FetchError::Cancelled) => return Err(JobError::Cancelled),
                Err(err) => {
                    warn!(error = %err, batch = index, size = batch.len(), "price batch failed");
                    report.failed_batches += 1;
                    last_error = Some(err.into());
                    continue;
                }
            };
            for id in batch {
                let Some(price) = prices.get(id) else {
                    debug!(%id, "no quote returned");
                    report.missing_prices += 1;
                    continue;
                };
                match self
                    .token_repo
                    .upsert_token_price(id, price.usd_price, price.change_24h)
                    .await
                {
                    Ok(()) => report.prices_upserted += 1,
                    Err(err) => {
                        warn!(error = %err, %id, "token price upsert failed");
                        report.price_upserts_failed += 1;
                    }
                }
            }
        }

        ctx.check()?;
        match self.pool_repo.list_tracked_pool_ids().await {
            Ok(pool_ids) if pool_ids.is_empty() => {}
            Ok(pool_ids) => {
                report.tracked_pools = pool_ids.len();
                if let Some(err) = self.refresh_pools(ctx, &pool_ids, &mut report).await? {
                    last_error = Some(err.into());
                }
            }
            Err(err) => {
                // token results stand; pools wait for the next pass
                warn!(error = %err, "tracked pool lookup failed");
                report.pool_fetch_failed = true;
                last_error = Some(err.into());
            }
        }

        metrics::counter!("worker_prices_upserted_total").increment(report.prices_upserted as u64);
        metrics::counter!("worker_pools_upserted_total").increment(report.pools_upserted as u64);

        if !report.made_progress() && report.had_fetch_failures() {
            if let Some(err) = last_error {
                return Err(err);
            }
        }
        Ok(report)
    }

    /// Upserts the tracked pools present in the fetch. Tracked pools missing
    /// from the response keep their previous row.
    async fn refresh_pools(
        &self,
        ctx: &CancelToken,
        pool_ids: &[String],
        report: &mut PriceRefreshReport,
    ) -> Result<Option<FetchError>, JobError> {
        let pools = match self.pool_source.fetch_yield_pools(ctx).await {
            Ok(pools) => pools,
            Err(FetchError::Cancelled) => return Err(JobError::Cancelled),
            Err(err) => {
                warn!(error = %err, "yield pool fetch failed");
                report.pool_fetch_failed = true;
                return Ok(Some(err));
            }
        };
        let tracked: HashSet<&str> = pool_ids.iter().map(String::as_str).collect();
        for snapshot in pools.iter().filter(|p| tracked.contains(p.pool_id.as_str())) {
            match self.pool_repo.upsert_yield_pool(snapshot).await {
                Ok(()) => report.pools_upserted += 1,
                Err(err) => {
                    warn!(error = %err, pool_id = %snapshot.pool_id, "yield pool upsert failed");
                    report.pool_upserts_failed += 1;
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl<P, Y, T, L> Job for PriceRefresher<P, Y, T, L>
where
    P: PriceSource + 'static,
    Y: YieldPoolSource + 'static,
    T: TokenRepository + 'static,
    L: YieldPoolRepository + 'static,
{
    fn name(&self) -> &'static str {
        PRICE_REFRESH_JOB
    }

    async fn run(&self, ctx: &CancelToken) -> Result<(), JobError> {
        let report = self.run_once(ctx).await?;
        info!(
            tokens = report.tracked_tokens,
            batches = report.batches,
            failed_batches = report.failed_batches,
            prices_upserted = report.prices_upserted,
            missing_prices = report.missing_prices,
            pools = report.tracked_pools,
            pools_upserted = report.pools_upserted,
            pool_fetch_failed = report.pool_fetch_failed,
            "price refresh finished"
        );
        Ok(())
    }
}

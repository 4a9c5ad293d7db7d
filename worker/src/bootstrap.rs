use std::sync::Arc;

use alert_engine::UnconfiguredAllowanceResolver;
use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use sqlx::PgPool;

use crate::{
    clients::{CoingeckoClient, DefiLlamaClient},
    config::WorkerConfig,
    rate_limiter::RateLimiter,
    repositories::{
        PostgresAlertRepository, PostgresPriceHistoryRepository, PostgresTokenRepository,
        PostgresYieldPoolRepository,
    },
    scheduler::{Scheduler, SchedulerConfig},
    services::{AlertEvaluator, HistoryBackfill, HttpNotifier, PriceRefresher},
};

pub type DbPriceRefresher = PriceRefresher<
    CoingeckoClient,
    DefiLlamaClient,
    PostgresTokenRepository,
    PostgresYieldPoolRepository,
>;

pub type DbAlertEvaluator = AlertEvaluator<
    PostgresAlertRepository,
    PostgresTokenRepository,
    PostgresYieldPoolRepository,
    HttpNotifier,
>;

pub type DbHistoryBackfill = HistoryBackfill<CoingeckoClient, PostgresPriceHistoryRepository>;

/// Every long-lived dependency the jobs and tools share.
#[derive(Clone)]
pub struct WorkerState {
    pub config: WorkerConfig,
    pub pool: PgPool,
    pub coingecko: Arc<CoingeckoClient>,
    pub defillama: Arc<DefiLlamaClient>,
    pub token_repo: Arc<PostgresTokenRepository>,
    pub pool_repo: Arc<PostgresYieldPoolRepository>,
    pub alert_repo: Arc<PostgresAlertRepository>,
    pub price_history_repo: Arc<PostgresPriceHistoryRepository>,
    pub notifier: Arc<HttpNotifier>,
}

pub async fn build_state(config: &WorkerConfig) -> Result<WorkerState> {
    let pool = PgPool::connect(&config.database_url)
        .await
        .context("failed to connect to postgres")?;
    sqlx::migrate!("../migrations").run(&pool).await?;

    let coingecko_limiter = RateLimiter::per_minute(config.coingecko_rate_limit_per_min)
        .context("invalid COINGECKO_RATE_LIMIT_PER_MIN")?;
    let defillama_limiter = RateLimiter::per_minute(config.defillama_rate_limit_per_min)
        .context("invalid DEFILLAMA_RATE_LIMIT_PER_MIN")?;

    let coingecko = Arc::new(CoingeckoClient::new(
        config.coingecko_api_base.clone(),
        config.coingecko_api_key.clone(),
        coingecko_limiter,
        config.http_timeout,
    )?);
    let defillama = Arc::new(DefiLlamaClient::new(
        config.defillama_api_base.clone(),
        config.defillama_yields_api_base.clone(),
        config.defillama_api_key.clone(),
        defillama_limiter,
        config.http_timeout,
    )?);
    let notifier = Arc::new(
        HttpNotifier::new(config.http_timeout)?
            .with_telegram(config.telegram_api_base.clone(), config.telegram_bot_token.clone()),
    );

    Ok(WorkerState {
        config: config.clone(),
        coingecko,
        defillama,
        token_repo: Arc::new(PostgresTokenRepository::new(pool.clone())),
        pool_repo: Arc::new(PostgresYieldPoolRepository::new(pool.clone())),
        alert_repo: Arc::new(PostgresAlertRepository::new(pool.clone())),
        price_history_repo: Arc::new(PostgresPriceHistoryRepository::new(pool.clone())),
        notifier,
        pool,
    })
}

impl WorkerState {
    pub fn price_refresher(&self) -> DbPriceRefresher {
        PriceRefresher::new(
            self.coingecko.clone(),
            self.defillama.clone(),
            self.token_repo.clone(),
            self.pool_repo.clone(),
            self.config.price_batch_size,
        )
    }

    pub fn alert_evaluator(&self) -> Result<DbAlertEvaluator> {
        let cooldown = ChronoDuration::from_std(self.config.alert_cooldown)
            .context("ALERT_COOLDOWN_SECS out of range")?;
        Ok(AlertEvaluator::new(
            self.alert_repo.clone(),
            self.token_repo.clone(),
            self.pool_repo.clone(),
            Arc::new(UnconfiguredAllowanceResolver),
            self.notifier.clone(),
            cooldown,
        ))
    }

    pub fn history_backfill(&self) -> DbHistoryBackfill {
        HistoryBackfill::new(self.coingecko.clone(), self.price_history_repo.clone())
    }

    /// Scheduler with every job enabled in the configuration registered.
    pub async fn scheduler(&self) -> Result<Scheduler> {
        let mut scheduler = Scheduler::new(SchedulerConfig {
            run_timeout: self.config.job_timeout,
            shutdown_grace: self.config.shutdown_grace,
            run_on_startup: self.config.run_on_startup,
        });
        if self.config.enable_price_refresh {
            scheduler
                .register(
                    Arc::new(self.price_refresher()),
                    self.config.price_refresh_interval,
                )
                .await;
        }
        if self.config.enable_alert_worker {
            scheduler
                .register(
                    Arc::new(self.alert_evaluator()?),
                    self.config.alert_eval_interval,
                )
                .await;
        }
        Ok(scheduler)
    }

    /// Stops the limiter refill tasks; pending acquires still honour their contexts.
    pub fn stop_limiters(&self) {
        self.coingecko.limiter().stop();
        self.defillama.limiter().stop();
    }
}

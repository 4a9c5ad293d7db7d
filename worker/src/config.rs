use std::{collections::HashMap, env, time::Duration};

use anyhow::{Context, Result};

const DEFAULT_CHAIN_NAMES: &[(u64, &str)] = &[
    (1, "Ethereum"),
    (10, "Optimism"),
    (56, "BSC"),
    (137, "Polygon"),
    (8453, "Base"),
    (42161, "Arbitrum"),
];

/// Chain id to the chain label DefiLlama uses in its pool listings.
#[derive(Clone, Debug)]
pub struct ChainNames(HashMap<u64, String>);

impl ChainNames {
    pub fn new(overrides: HashMap<u64, String>) -> Self {
        let mut names: HashMap<u64, String> = DEFAULT_CHAIN_NAMES
            .iter()
            .map(|(id, name)| (*id, name.to_string()))
            .collect();
        names.extend(overrides);
        Self(names)
    }

    /// Accepts a numeric chain id or a chain name; unknown ids pass through as-is.
    pub fn resolve(&self, input: &str) -> String {
        let input = input.trim();
        match input.parse::<u64>() {
            Ok(id) => self
                .0
                .get(&id)
                .cloned()
                .unwrap_or_else(|| input.to_string()),
            Err(_) => input.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub coingecko_api_base: String,
    pub coingecko_api_key: Option<String>,
    pub coingecko_rate_limit_per_min: u32,
    pub defillama_api_base: String,
    pub defillama_yields_api_base: String,
    pub defillama_api_key: Option<String>,
    pub defillama_rate_limit_per_min: u32,
    pub http_timeout: Duration,
    pub price_batch_size: usize,
    pub price_refresh_interval: Duration,
    pub alert_eval_interval: Duration,
    pub job_timeout: Duration,
    pub shutdown_grace: Duration,
    pub alert_cooldown: Duration,
    pub run_on_startup: bool,
    pub enable_price_refresh: bool,
    pub enable_alert_worker: bool,
    pub token_price_ids: HashMap<String, String>,
    pub chain_names: ChainNames,
    pub telegram_bot_token: Option<String>,
    pub telegram_api_base: String,
    pub port: u16,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set for worker")?,
            coingecko_api_base: env::var("COINGECKO_API_BASE")
                .unwrap_or_else(|_| "https://api.coingecko.com/api/v3".to_string()),
            coingecko_api_key: non_empty_var("COINGECKO_API_KEY"),
            coingecko_rate_limit_per_min: parse_u32("COINGECKO_RATE_LIMIT_PER_MIN", 50),
            defillama_api_base: env::var("DEFILLAMA_API_BASE")
                .unwrap_or_else(|_| "https://api.llama.fi".to_string()),
            defillama_yields_api_base: env::var("DEFILLAMA_YIELDS_API_BASE")
                .unwrap_or_else(|_| "https://yields.llama.fi".to_string()),
            defillama_api_key: non_empty_var("DEFILLAMA_API_KEY"),
            defillama_rate_limit_per_min: parse_u32("DEFILLAMA_RATE_LIMIT_PER_MIN", 300),
            http_timeout: parse_duration_seconds("HTTP_TIMEOUT_SECS", 30),
            price_batch_size: parse_usize("PRICE_BATCH_SIZE", 50),
            price_refresh_interval: parse_duration_seconds("PRICE_REFRESH_INTERVAL_SECS", 600),
            alert_eval_interval: parse_duration_seconds("ALERT_EVAL_INTERVAL_SECS", 300),
            job_timeout: parse_duration_seconds("JOB_TIMEOUT_SECS", 300),
            shutdown_grace: parse_duration_seconds("SHUTDOWN_GRACE_SECS", 30),
            alert_cooldown: parse_duration_seconds("ALERT_COOLDOWN_SECS", 3600),
            run_on_startup: parse_bool("RUN_ON_STARTUP", true),
            enable_price_refresh: parse_bool("ENABLE_PRICE_REFRESH", true),
            enable_alert_worker: parse_bool("ENABLE_ALERT_WORKER", true),
            token_price_ids: env::var("TOKEN_PRICE_IDS")
                .map(|raw| split_token_price_ids(&raw))
                .unwrap_or_default(),
            chain_names: ChainNames::new(
                env::var("CHAIN_NAMES")
                    .map(|raw| split_chain_names(&raw))
                    .unwrap_or_default(),
            ),
            telegram_bot_token: non_empty_var("TELEGRAM_BOT_TOKEN"),
            telegram_api_base: env::var("TELEGRAM_API_BASE")
                .unwrap_or_else(|_| "https://api.telegram.org".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8082".to_string())
                .parse()
                .context("PORT must be a valid u16")?,
        })
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_duration_seconds(key: &str, default: u64) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .unwrap_or_else(|| Duration::from_secs(default))
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| truthy(&v))
        .unwrap_or(default)
}

fn truthy(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// `ETH:ethereum,USDC:usd-coin` into upper-cased symbols and lower-cased ids.
fn split_token_price_ids(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|item| {
            let (symbol, id) = item.split_once(':')?;
            let symbol = symbol.trim().to_uppercase();
            let id = id.trim().to_lowercase();
            if symbol.is_empty() || id.is_empty() {
                return None;
            }
            Some((symbol, id))
        })
        .collect()
}

fn split_chain_names(raw: &str) -> HashMap<u64, String> {
    raw.split(',')
        .filter_map(|item| {
            let (chain, name) = item.split_once('=')?;
            let chain_id = chain.trim().parse::<u64>().ok()?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((chain_id, name.to_string()))
        })
        .collect()
}

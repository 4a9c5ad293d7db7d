use std::env;

use worker::{
    bootstrap::build_state,
    cancel::CancelSource,
    clients::{filter_pools_by_chain, YieldPoolSource},
    config::WorkerConfig,
    telemetry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing()?;

    let config = WorkerConfig::from_env()?;
    let state = build_state(&config).await?;
    let ctx = CancelSource::new();
    let token = ctx.token().with_timeout(config.job_timeout);

    let mut args = env::args().skip(1);
    let cmd = args.next().unwrap_or_default();

    match cmd.as_str() {
        "refresh-once" => {
            let report = state.price_refresher().run_once(&token).await?;
            println!("{report:#?}");
        }
        "evaluate-once" => {
            let report = state.alert_evaluator()?.run_once(&token).await?;
            println!("{report:#?}");
        }
        "pools" => {
            let chain = args
                .next()
                .ok_or_else(|| anyhow::anyhow!("missing chain id or name"))?;
            let chain = config.chain_names.resolve(&chain);
            let pools = state.defillama.fetch_yield_pools(&token).await?;
            let mut pools = filter_pools_by_chain(&pools, &chain);
            pools.sort_by(|a, b| b.tvl_usd.total_cmp(&a.tvl_usd));
            for pool in &pools {
                println!(
                    "{} {} {} tvl=${:.0} apy={:.2}%",
                    pool.pool_id, pool.protocol, pool.symbol, pool.tvl_usd, pool.apy
                );
            }
            println!("{} pools on {chain}", pools.len());
        }
        "protocol-tvl" => {
            let slug = args
                .next()
                .ok_or_else(|| anyhow::anyhow!("missing protocol slug"))?;
            let tvl = state.defillama.fetch_protocol_tvl(&token, &slug).await?;
            println!("{} tvl=${:.0}", tvl.name, tvl.tvl);
        }
        _ => {
            eprintln!(
                "Usage: cargo run -p worker --bin worker_tools -- <command>\n\
                 Commands:\n  refresh-once\n  evaluate-once\n  pools <chain-id|name>\n  protocol-tvl <slug>"
            );
        }
    }

    state.stop_limiters();
    Ok(())
}

use std::net::SocketAddr;

use anyhow::Context;
use worker::{
    app::{build_router, prometheus_handle},
    bootstrap::build_state,
    cancel::CancelSource,
    config::WorkerConfig,
    telemetry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing()?;
    prometheus_handle();

    let config = WorkerConfig::from_env()?;
    let state = build_state(&config).await?;
    let scheduler = state.scheduler().await?;
    if scheduler.is_empty() {
        tracing::warn!("no jobs enabled; serving health and metrics only");
    }
    let app = build_router(scheduler.handle());

    let shutdown = CancelSource::new();
    let scheduler_stop = shutdown.token();
    let server_stop = shutdown.token();

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "listening on address");
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_stop.cancelled().await })
            .await
    });

    let jobs = tokio::spawn(scheduler.run(async move { scheduler_stop.cancelled().await }));

    shutdown_signal().await;
    shutdown.cancel();

    let report = jobs.await.context("scheduler task failed")?;
    tracing::info!(
        completed = ?report.completed,
        timed_out = ?report.timed_out,
        "scheduler stopped"
    );
    state.stop_limiters();
    server.await.context("http server task failed")??;
    state.pool.close().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received, stopping");
}

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;

use geocode_relay::config::AppConfig;
use geocode_relay::{init_tracing, router, spawn_janitor, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = AppConfig::from_env();

    let bind_addr = config.bind_addr.clone();
    let janitor_every = Duration::from_secs(config.janitor_interval_secs);
    let (state, receiver) =
        AppState::from_config(config).context("failed to build geocoding pipeline")?;
    let state = Arc::new(state);

    let worker = receiver.map(|receiver| state.worker().spawn(receiver));
    let janitor = spawn_janitor(state.store(), janitor_every);

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!(addr = %bind_addr, version = env!("CARGO_PKG_VERSION"), "geocode relay listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    janitor.abort();
    if let Some(worker) = worker {
        worker.abort();
    }
    info!("geocode relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::warn!(?err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::warn!(?err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => info!("received Ctrl+C"),
        () = terminate => info!("received SIGTERM"),
    }
    info!("shutdown signal received, draining connections");
}

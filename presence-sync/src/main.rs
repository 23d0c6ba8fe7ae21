use presence_sync::config::Config;
use presence_sync::directory::{LocalPlayers, LogDispatch};
use presence_sync::{Collaborators, Instance, create_app};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing for structured logging, RUST_LOG overrides the default
    #[cfg(debug_assertions)]
    let log_level = "debug";
    #[cfg(not(debug_assertions))]
    let log_level = "info";

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .with_target(false)
        .compact()
        .init();
    tracing::info!("Starting presence-sync...");

    let config = Config::from_env();
    tracing::info!(
        "Configuration: proxy_id={}, pool={}, heartbeat={}s, reconcile={}s, workers={}, port={}",
        config.proxy_id,
        config.pool_size,
        config.heartbeat_interval.as_secs(),
        config.reconcile_interval.as_secs(),
        config.worker_threads,
        config.status_port
    );

    let backend = presence_store::open(&config.store_url, config.pool_size, config.pool_timeout)?;
    let collaborators = Collaborators {
        directory: Arc::new(LocalPlayers::new()),
        dispatcher: Arc::new(LogDispatch),
        lookup: None,
    };
    let instance = Arc::new(Instance::start(config.clone(), backend, collaborators).await?);

    let app = create_app(
        instance.clone(),
        config.request_body_limit,
        config.request_timeout,
    );
    let addr = format!("0.0.0.0:{}", config.status_port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Status API listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    instance.shutdown().await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Unable to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutdown signal received");
}

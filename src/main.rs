//! FleetWatch - Main Entry Point

use anyhow::Context;
use fleetwatch::{api, MonitorConfig, MonitorService};
use sqlx::mysql::MySqlPoolOptions;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("FleetWatch v{}", env!("CARGO_PKG_VERSION"));

    let config = MonitorConfig::from_env();
    config.validate().context("invalid configuration")?;

    // Lazy pool: a down database delays the first cycle, not startup
    let pool = MySqlPoolOptions::new()
        .max_connections(5)
        .connect_lazy(&config.database.url())
        .context("invalid database URL")?;

    let bind_addr = format!("{}:{}", config.host, config.port);
    let service = Arc::new(MonitorService::new(config, pool)?);
    service.start();

    let app = api::router(service.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("cannot bind {bind_addr}"))?;
    tracing::info!("Monitoring API listening on {bind_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(service))
        .await?;

    Ok(())
}

async fn shutdown_signal(service: Arc<MonitorService>) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    tracing::info!("Shutdown signal received");
    // The in-flight cycle finishes; the next one is skipped.
    service.stop();
}

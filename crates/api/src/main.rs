use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use fieldsync_api::app::{build_app_with, services::AppServices};
use fieldsync_api::config::ServerConfig;
use fieldsync_ledger::spawn_expiry_sweeper;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fieldsync_observability::init();

    let config = ServerConfig::from_env().context("invalid server configuration")?;

    let services = Arc::new(
        AppServices::from_config(&config)
            .await
            .context("failed to initialise idempotency ledger")?,
    );

    let shutdown = CancellationToken::new();
    let sweeper = spawn_expiry_sweeper(
        services.ledger_store(),
        config.sweep_interval,
        shutdown.clone(),
    );

    let app = build_app_with(config.jwt_secret.clone(), services);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            signal.cancel();
        })
        .await
        .context("server error")?;

    shutdown.cancel();
    sweeper.await.context("ledger sweeper panicked")?;
    Ok(())
}

use std::sync::Arc;

use anyhow::Context;

use storyforge_api::app::{build_app, services};
use storyforge_infra::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    storyforge_observability::init();

    let config = AppConfig::from_env().context("failed to load configuration")?;
    let services = Arc::new(
        services::build_services(config.clone())
            .await
            .context("failed to initialize job services")?,
    );

    let reaper = services.reaper().spawn(config.reap_interval);
    let app = build_app(services);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    reaper.shutdown().await;
    tracing::info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

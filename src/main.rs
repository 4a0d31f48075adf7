//! notebook-gateway server entry point.
//!
//! Starts the Axum HTTP server with REST and WebSocket endpoints.

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use notebook_gateway::app_state::AppState;
use notebook_gateway::build_app;
use notebook_gateway::config::GatewayConfig;
use notebook_gateway::service::{SessionRegistry, SupervisedLauncher};
use notebook_gateway::supervisor::ProcessSupervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    // Load configuration
    let config = Arc::new(GatewayConfig::from_env().context("loading configuration")?);
    tracing::info!(addr = %config.listen_addr, "starting notebook-gateway");
    tokio::fs::create_dir_all(&config.kernel_runtime_dir)
        .await
        .with_context(|| {
            format!(
                "creating runtime dir {}",
                config.kernel_runtime_dir.display()
            )
        })?;

    // Build kernel supervision
    let supervisor = Arc::new(ProcessSupervisor::new(
        config.retry_policy(),
        config.restart_policy(),
        config.stop_timeout,
    ));
    let launcher = Arc::new(SupervisedLauncher::new(
        supervisor,
        config.kernel_template(),
        config.heartbeat(),
    ));

    // Build service layer
    let registry = Arc::new(SessionRegistry::new(launcher, config.session_settings()));

    let app = build_app(AppState {
        registry: Arc::clone(&registry),
        config: Arc::clone(&config),
    });

    // Start server
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    registry.shutdown_all().await;
    tracing::info!("notebook-gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

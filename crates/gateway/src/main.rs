//! Toolgate Gateway - Main Entry Point
//!
//! Starts the tool worker under supervision and serves the HTTP facade.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use toolgate_common::ToolgateConfig;
use toolgate_gateway::{build_router, AppState, ToolClient};
use toolgate_supervisor::{CommandLauncher, Launcher, Supervisor, SupervisorOptions};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = match std::env::var("TOOLGATE_CONFIG") {
        Ok(path) => ToolgateConfig::from_file(path)?,
        Err(_) => ToolgateConfig::from_env()?,
    };
    let observability = config.observability();

    // Initialize logging
    let level = observability.log_level.as_str();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "toolgate_gateway={level},toolgate_supervisor={level},tower_http={level}"
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Toolgate gateway");

    // Start the supervised worker
    let launcher = CommandLauncher::new(config.worker.clone());
    info!("Worker command: {}", launcher.describe());

    let (supervisor, supervisor_task) =
        Supervisor::start(Arc::new(launcher), SupervisorOptions::from_config(&config));

    let state = AppState::new(ToolClient::new(supervisor.clone()), observability.enable_metrics);
    let app = build_router(state, config.static_dir.as_deref());

    let listener = TcpListener::bind(config.listen_address()).await?;
    info!("Toolgate gateway listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    supervisor.shutdown().await;
    supervisor_task.await?;

    info!("Toolgate gateway shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}

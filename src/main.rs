mod admin;
mod backend;
mod cli;
mod config;
mod driver;
mod gateway;
mod pool;
mod preload;
mod registry;
mod rewriter;
#[cfg(all(test, feature = "admin"))]
mod testutil;
#[cfg(all(test, feature = "admin"))]
mod integration_tests;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gateway::Gateway;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    // Load ~/.env into the process environment, once, before any
    // concurrent work starts.
    config::load_dotenv();

    let config = config::GatewayConfig::load(&cli.config)?;

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    info!(
        config_path = %cli.config.display(),
        backends = config.backends.len(),
        "forgegate starting"
    );

    let admin_config = config.admin.clone();
    let gateway = Arc::new(Gateway::start(config)?);

    #[cfg(feature = "admin")]
    let admin_handle = if admin_config.enabled {
        let state = admin::api::AdminState {
            gateway: Arc::clone(&gateway),
        };
        let listen = admin_config.listen.clone();
        let shutdown = Arc::new(tokio::sync::Notify::new());
        let shutdown_for_task = Arc::clone(&shutdown);
        let handle = tokio::spawn(async move {
            if let Err(e) = admin::api::start(state, &listen, shutdown_for_task).await {
                tracing::error!(error = %e, "admin API failed");
            }
        });
        Some((handle, shutdown))
    } else {
        None
    };

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("received ctrl-c");
    }

    info!("shutting down");

    #[cfg(feature = "admin")]
    if let Some((handle, shutdown)) = admin_handle {
        shutdown.notify_waiters();
        if let Err(e) = handle.await {
            warn!(error = %e, "admin API task panicked during shutdown");
        }
    }

    gateway.shutdown().await;

    Ok(())
}

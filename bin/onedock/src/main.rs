//! onedock daemon entry point

mod api;
mod cli;
mod config;

use clap::Parser;
use cli::{Cli, Commands};
use config::{LogFormat, OnedockConfig};
use onedock_core::ServiceOrchestrator;
use onedock_proxy::BalanceStrategy;
use onedock_runtime::{DockerRuntime, NameCodec, PortAllocator};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = OnedockConfig::load(cli.config.as_deref())?;

    init_tracing(&config, cli.verbose);

    match cli.command {
        Commands::Serve { listen } => {
            let listen = listen.unwrap_or_else(|| config.server.listen.clone());
            serve(config, listen).await
        }
    }
}

fn init_tracing(config: &OnedockConfig, verbose: u8) {
    let level = match verbose {
        0 => config.logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.logging.format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn serve(config: OnedockConfig, listen: String) -> anyhow::Result<()> {
    let codec = NameCodec::new(config.container.prefix.clone());
    let runtime = Arc::new(DockerRuntime::new(codec.clone()).await?);

    let orchestrator = Arc::new(ServiceOrchestrator::new(
        runtime,
        codec,
        PortAllocator::new(config.container.internal_port_start),
        Duration::from_secs(config.container.cache_ttl),
        BalanceStrategy::parse(&config.container.load_balance_strategy),
    ));

    // Bring proxies back for services that survived the last daemon run
    orchestrator.recover().await;

    let app = api::router(Arc::clone(&orchestrator));
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    info!(listen = %listen, "management API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down proxy fleet");
    orchestrator.shutdown().await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("received shutdown signal");
}

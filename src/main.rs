use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use patchbay::{Gateway, GatewayConfig, MemoryStore, server};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "patchbay")]
#[command(about = "Serves the composite API of all configured plugins")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "patchbay.yaml")]
    config: PathBuf,

    /// Port to listen on, overriding the configuration file
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .compact()
        .init();

    let mut config = if args.config.exists() {
        GatewayConfig::load(&args.config)
            .with_context(|| format!("loading {}", args.config.display()))?
    } else {
        warn!(path = %args.config.display(), "config file not found, using defaults");
        GatewayConfig::default()
    };
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let gateway = Arc::new(
        Gateway::from_config(&config, Arc::new(MemoryStore::new()))
            .context("building composite schema")?,
    );

    let addr = config.listen_addr();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!(%addr, plugins = ?config.plugins, "patchbay listening on /graphql");

    server::serve(listener, gateway, shutdown_signal()).await?;
    Ok(())
}

/// Resolves on Ctrl-C. If the handler cannot be installed the server keeps
/// running instead of exiting straight away.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

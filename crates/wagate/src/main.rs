use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use wagate::config::Config;
use wagate::protocol::BridgeClientFactory;
use wagate::server::{self, AppState};
use wagate::session::LifecycleManager;
use wagate::store::SessionStore;

#[derive(Parser)]
#[command(name = "wagate", version, about = "Multi-tenant WhatsApp session gateway")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "wagate.yaml")]
    config: PathBuf,

    /// Override the listening port
    #[arg(short, long)]
    port: Option<u16>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut config = Config::load(&cli.config)
        .await
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;
    config
        .apply_env()
        .context("invalid environment override")?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    let store = SessionStore::from_config(&config.store);
    let factory = Arc::new(BridgeClientFactory::new(
        config.protocol.bridge.clone(),
        config.protocol.client.clone(),
    ));
    let manager = LifecycleManager::new(factory, store, config.lifecycle.clone());

    let app = server::build_app(
        AppState::new(manager.clone()),
        config.server.request_timeout_seconds,
    );

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(%addr, "wagate listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(server::shutdown_on(shutdown_signal(), manager))
        .await
        .context("server error")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

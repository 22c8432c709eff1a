use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use shadowgate_core::config::load_config;
use shadowgate_gateway::AppState;
use shadowgate_gateway::build_router;

/// Transparent LLM proxy that compresses tool outputs in flight.
#[derive(Debug, Parser)]
#[command(name = "shadowgate", version)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, short, default_value = "config.yaml")]
    config: PathBuf,

    /// Override the configured listen port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = load_config(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    let port = config.server.port;
    let state = AppState::from_config(config).context("building gateway state")?;
    let sweeper = state.start_sweeper();

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "shadowgate listening");

    let router = build_router(state);
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await
        .context("serving")?;

    sweeper.abort();
    Ok(())
}

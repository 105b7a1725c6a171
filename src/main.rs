use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use repocache::AppState;
use repocache::config::{self, Config};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "repocache", about = "Caching reverse proxy for artifact repositories")]
struct Cli {
    /// TCP port to listen on.  Overrides `proxy.port` from the config file.
    #[arg(short, long)]
    port: Option<u16>,

    /// Path to an optional YAML configuration file.
    #[arg(short, long)]
    config: Option<String>,
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState) -> Result<()> {
    let listen_addr = state.config.proxy.listen_addr();
    let app = repocache::http::create_router(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    tracing::info!("HTTP server stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // ---- Config ----
    let mut config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => Config::default(),
    };
    if let Some(port) = cli.port {
        config.proxy.port = port;
    }

    tracing::info!(
        config_path = cli.config.as_deref().unwrap_or("<defaults>"),
        upstream = %config.upstream.url,
        cache_root = %config.cache.path.display(),
        "starting repocache"
    );

    // ---- Ensure cache root exists ----
    tokio::fs::create_dir_all(&config.cache.path)
        .await
        .with_context(|| {
            format!(
                "failed to create cache directory: {}",
                config.cache.path.display()
            )
        })?;

    // ---- App state ----
    let state = AppState::new(config)?;

    if let Err(e) = run_http_server(state).await {
        tracing::error!(error = %format!("{e:#}"), "HTTP server failed");
        return Err(e);
    }

    Ok(())
}

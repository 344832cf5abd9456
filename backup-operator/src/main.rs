//! Backup Operator - Main entry point
//!
//! Runs collection backups on cron schedules, applies retention and serves a
//! small HTTP API for status, manual backups and restores.

mod adapters;
mod config;
mod db;
mod error;
mod routes;
mod services;
mod state;
#[cfg(test)]
mod testing;

use crate::adapters::{LocalBlobStore, QdrantClient, SecretFileResolver};
use crate::config::AppConfig;
use crate::db::connection::{close_pool, create_pool};
use crate::db::migrate::migrate;
use crate::services::recovery::recover_interrupted;
use crate::services::schedule_ticker::start_schedule_ticker;
use crate::state::AppState;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// How long in-flight backups and restores may run after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(level) = args.log_level {
        config.server.log_level = level;
    }

    backup_engine::logger::init(&config.server.log_level)?;
    tracing::info!(
        "Starting backup-operator v{} ({} clusters, {} schedules)",
        env!("CARGO_PKG_VERSION"),
        config.clusters.len(),
        config.schedules.len()
    );

    // Ensure data directories exist
    std::fs::create_dir_all(&config.server.data_dir)?;
    std::fs::create_dir_all(config.blob_root())?;

    // Initialize database
    let db_path = config.db_path().to_string_lossy().to_string();
    let pool = create_pool(&db_path)?;
    migrate(&pool)?;

    // Collaborators
    let qdrant = Arc::new(QdrantClient::new(&config.clusters)?);
    let blobs = Arc::new(LocalBlobStore::new(config.blob_root()));
    let secrets = Arc::new(SecretFileResolver::new(config.secrets_dir()));

    let port = config.server.port;
    let state = Arc::new(AppState::new(pool, config, qdrant.clone(), qdrant, blobs, secrets));

    recover_interrupted(&state).await?;
    let ticker = start_schedule_ticker(state.clone());

    let app = routes::create_router(state.clone());
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.shutdown.clone()))
        .await?;

    // Cleanup
    tracing::info!("Shutting down...");
    state.shutdown.cancel();
    if let Err(e) = ticker.await {
        tracing::warn!("Schedule ticker ended abnormally: {}", e);
    }

    state.tasks.close();
    if tokio::time::timeout(DRAIN_TIMEOUT, state.tasks.wait()).await.is_err() {
        tracing::warn!("{} backup/restore task(s) still running at exit", state.tasks.len());
    }

    close_pool(&state.db);
    tracing::info!("Operator stopped");

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl+c: {}", e);
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
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
        _ = cancel.cancelled() => {},
    }

    cancel.cancel();
}

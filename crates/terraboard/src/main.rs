use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dotenvy::dotenv;
use tokio::signal;
use tracing::{error, info, warn};

use terraboard::cli::Cli;
use terraboard::config::Config;
use terraboard::sync::{SharedState, SyncOptions, Syncer};

#[tokio::main]
async fn main() {
    // Load .env file from the current directory
    dotenv().ok();

    let cli = Cli::parse();
    let config = match Config::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = monitoring::init_logging(&config.log.level, &config.log.format) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }

    info!("🚀 Starting terraboard state indexer");

    let db = match store::Database::new(&config.database.url()).await {
        Ok(db) => Arc::new(db),
        Err(e) => {
            error!("Failed to connect to the database: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = db.migrate().await {
        error!("Failed to initialize the database schema: {e}");
        std::process::exit(1);
    }

    let providers = match providers::build_providers(&config.providers).await {
        Ok(providers) => providers,
        Err(e) => {
            error!("Failed to configure providers: {e}");
            std::process::exit(1);
        }
    };
    info!(count = providers.len(), "Providers configured");

    let state = SharedState::new();
    spawn_signal_handler(state.clone());

    if config.database.no_sync {
        info!("Background sync disabled, serving queries only");
        while !state.is_shutting_down() {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    } else {
        let options = SyncOptions {
            interval_minutes: config.database.sync_interval,
            orphan_grace: config
                .database
                .orphan_grace_minutes
                .map(|m| chrono::Duration::minutes(m as i64)),
            ..Default::default()
        };
        let syncer = Syncer::new(db, providers, options, state.clone());
        syncer.run().await;
    }

    info!("👋 Shutdown complete");
}

/// First SIGINT/SIGTERM requests a graceful stop; a second SIGINT
/// terminates immediately.
fn spawn_signal_handler(state: SharedState) {
    tokio::spawn(async move {
        let mut sigint = match signal::unix::signal(signal::unix::SignalKind::interrupt()) {
            Ok(sig) => sig,
            Err(e) => {
                error!("Failed to create SIGINT handler: {e}. Graceful shutdown disabled.");
                return;
            }
        };
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                error!("Failed to create SIGTERM handler: {e}. Graceful shutdown disabled.");
                return;
            }
        };

        tokio::select! {
            _ = sigint.recv() => {
                warn!("⚠️  Received SIGINT, initiating graceful shutdown...");
                state.set_shutdown();
                if sigint.recv().await.is_some() {
                    error!("🛑 Second SIGINT received, forcing immediate shutdown");
                    std::process::exit(1);
                }
            }
            _ = sigterm.recv() => {
                warn!("⚠️  Received SIGTERM, initiating graceful shutdown...");
                state.set_shutdown();
            }
        }
    });
}

//! # permsync-server
//!
//! Follows remote domain allow/block lists and keeps the local permission
//! store in line with them.
//!
//! This binary provides:
//! - **Subscription workers** that fetch, parse and merge each list on a
//!   jittered interval
//! - **Admin API** (axum) to manage subscriptions and moderate the
//!   resulting domain permissions

mod api;
mod config;
mod error;
mod validate;

use std::sync::{Arc, Mutex};

use tracing::info;
use tracing_subscriber::EnvFilter;

use permsync_engine::{ScheduleConfig, Scheduler, SharedDb, SyncEngine};
use permsync_net::Fetcher;
use permsync_shared::crypto::CredentialCipher;
use permsync_store::Database;

use crate::api::AppState;
use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,permsync_server=debug")),
        )
        .init();

    info!("Starting permsync server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let db: SharedDb = Arc::new(Mutex::new(Database::open_at(&config.database_path)?));
    let cipher = CredentialCipher::new(config.credential_key);
    let fetcher = Fetcher::new(config.fetch_timeout, config.fetch_max_bytes)?;

    let engine = Arc::new(SyncEngine::new(db.clone(), Arc::new(fetcher), cipher.clone()));
    let scheduler = Arc::new(Scheduler::new(
        engine,
        ScheduleConfig {
            interval: config.sync_interval,
            jitter: config.sync_jitter,
        },
    ));

    // -----------------------------------------------------------------------
    // 4. Start one worker per stored subscription
    // -----------------------------------------------------------------------
    scheduler.bootstrap()?;

    let app_state = AppState {
        db,
        scheduler: scheduler.clone(),
        cipher: Arc::new(cipher),
        config: Arc::new(config.clone()),
    };

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server until it fails or Ctrl+C arrives
    // -----------------------------------------------------------------------
    let result = tokio::select! {
        result = api::serve(app_state, config.http_addr) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            Ok(())
        }
    };

    scheduler.shutdown().await;

    if let Err(e) = &result {
        tracing::error!(error = %e, "HTTP server failed");
    }
    result
}

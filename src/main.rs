//! Resumable Upload Server
//!
//! HTTP server for resumable chunked uploads with durable sessions and a
//! background expiry reaper.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use resumable_upload_server::config::Config;
use resumable_upload_server::db::{self, SqliteSessionRegistry};
use resumable_upload_server::routes;
use resumable_upload_server::state::AppState;
use resumable_upload_server::storage::{DirectoryQuota, QuotaGate, TargetFs, Unlimited};
use resumable_upload_server::upload::{ChunkStore, ExpiryReaper, UploadCoordinator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "resumable_upload_server=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("Failed to load configuration")?;

    tracing::info!("Starting Resumable Upload Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Storage root: {}", config.storage.root.display());
    tracing::info!("Chunk directory: {}", config.upload.temp_dir.display());

    tokio::fs::create_dir_all(&config.storage.root)
        .await
        .with_context(|| format!("Failed to create {}", config.storage.root.display()))?;
    tokio::fs::create_dir_all(&config.upload.temp_dir)
        .await
        .with_context(|| format!("Failed to create {}", config.upload.temp_dir.display()))?;

    // Initialize database
    let db_pool = db::create_pool(&config.database.url)
        .await
        .context("Failed to initialize database")?;
    tracing::info!("Database initialized at {}", config.database.url);

    let quota: Arc<dyn QuotaGate> = match config.storage.quota_bytes {
        Some(limit) => {
            tracing::info!("Storage quota: {} bytes", limit);
            Arc::new(DirectoryQuota::new(config.storage.root.clone(), limit))
        }
        None => Arc::new(Unlimited),
    };

    let coordinator = UploadCoordinator::new(
        Arc::new(SqliteSessionRegistry::new(db_pool.clone())),
        ChunkStore::new(config.upload.temp_dir.clone()),
        TargetFs::new(config.storage.root.clone()),
        quota,
        config.upload.coordinator_config(),
    );

    let reaper = ExpiryReaper::new(coordinator.clone(), config.upload.reaper_interval()).start();

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid SERVER_HOST/SERVER_PORT")?;

    let app = routes::app(AppState::new(config, db_pool, coordinator));

    // Start server with graceful shutdown
    tracing::info!("Resumable Upload Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    reaper.abort();
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}

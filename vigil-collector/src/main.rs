/**
 * VIGIL COLLECTOR - Entry point
 *
 * ROLE : wires configuration, storage backend, backup controller, ingestion
 * and the HTTP API, then serves until SIGINT/SIGTERM.
 *
 * BACKENDS : Postgres when a DSN is configured, otherwise the in-memory store
 * made durable by file snapshots.
 *
 * SHUTDOWN : stop accepting requests, let in-flight ones finish, write the
 * final snapshot, exit.
 */

mod backup;
mod config;
mod error;
mod health;
mod http;
mod ingest;
mod retry;
mod state;
mod storage;

use crate::backup::BackupController;
use crate::config::CollectorConfig;
use crate::health::HealthTracker;
use crate::ingest::Ingestor;
use crate::retry::RetryExecutor;
use crate::state::AppState;
use crate::storage::{MemoryStore, MetricStore, PostgresStore};

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vigil_protocol::EnvelopeCodec;

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();

    let cfg = CollectorConfig::load().await.context("failed to load collector configuration")?;
    init_tracing(&cfg.log_level);
    match &cfg.loaded_from {
        Some(path) => info!(path = %path.display(), "configuration loaded"),
        None => info!("no configuration file, using defaults"),
    }
    info!(address = %cfg.address, "starting vigil collector");

    let store: Arc<dyn MetricStore> = match cfg.database_dsn.as_deref() {
        Some(dsn) => Arc::new(
            PostgresStore::connect(dsn, RetryExecutor::default())
                .await
                .context("failed to open the Postgres store")?,
        ),
        None => Arc::new(MemoryStore::new()),
    };
    info!(backend = store.backend(), "storage ready");

    let codec = Arc::new(EnvelopeCodec::new(
        cfg.envelope_keys().context("failed to load envelope keys")?,
    ));
    if !codec.signs() {
        warn!("no signing key configured, unsigned requests are accepted");
    }

    let shutdown = CancellationToken::new();

    // file backups only make sense for the in-memory store
    let backup = if cfg.database_dsn.is_none() && cfg.backup_enabled() {
        let controller = Arc::new(BackupController::new(&cfg.file_storage_path, store.clone()));
        info!(path = %controller.path().display(), interval_secs = cfg.store_interval_secs, "file backups enabled");
        if cfg.restore {
            controller
                .restore()
                .await
                .with_context(|| format!("failed to restore {}", cfg.file_storage_path.display()))?;
        }
        Some(controller)
    } else {
        None
    };
    let backup_task = backup
        .clone()
        .map(|controller| controller.spawn(cfg.store_interval(), shutdown.clone()));
    let sync_backup = backup.filter(|_| cfg.store_interval().is_zero());

    let health_tracker = HealthTracker::new();
    let ingestor = Arc::new(Ingestor::new(store, codec, sync_backup, health_tracker.clone()));
    let app = http::build_router(AppState::new(ingestor, health_tracker));

    let listener = TcpListener::bind(&cfg.address)
        .await
        .with_context(|| format!("cannot listen on {}", cfg.address))?;
    info!("listening on http://{}", cfg.address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("HTTP server stopped, flushing");
    shutdown.cancel();
    if let Some(task) = backup_task {
        task.await.context("backup task panicked")?;
    }
    info!("collector stopped");
    Ok(())
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}

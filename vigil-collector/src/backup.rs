/**
 * BACKUP / RESTORE - File snapshots of the metric store
 *
 * ROLE :
 * Makes the in-memory store survive restarts.
 *
 * FORMAT :
 * One wire record per line (`{"id":"cpu","type":"gauge","value":1.5}`).
 * Restore also accepts a single JSON array of the same records.
 *
 * LIFECYCLE :
 * - startup: restore() once, before the listener opens
 * - running: snapshot() on every timer tick (or after every write when the
 *   interval is zero, driven by the ingestion path)
 * - shutdown: one last snapshot() when the cancellation token fires
 *
 * A snapshot truncates the file and rewrites it in place; a crash between the
 * truncate and the sync loses the previous backup.
 */

use crate::storage::{MetricStore, StoreError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use vigil_protocol::MetricSample;

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("backup file I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("backup file is malformed: {0}")]
    Format(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct BackupController {
    path: PathBuf,
    store: Arc<dyn MetricStore>,
    /// Serializes snapshot writers (timer task and synchronous mode).
    write_lock: Mutex<()>,
}

impl BackupController {
    pub fn new(path: impl Into<PathBuf>, store: Arc<dyn MetricStore>) -> Self {
        Self { path: path.into(), store, write_lock: Mutex::new(()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the backup file into the store; a missing or blank file leaves the
    /// store empty. Returns the number of restored metrics.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub async fn restore(&self) -> Result<usize, BackupError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("no backup file, starting empty");
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        let samples = parse_records(&text)?;
        let count = samples.len();
        self.store.replace_all(samples).await?;
        info!(count, "restored metrics from backup");
        Ok(count)
    }

    /// Writes the full current metric set over the backup file.
    pub async fn snapshot(&self) -> Result<usize, BackupError> {
        let _guard = self.write_lock.lock().await;

        let samples = self.store.list_all().await?;
        let buf = render_records(&samples)?;

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .await?;
        file.write_all(&buf).await?;
        file.flush().await?;
        file.sync_data().await?;

        debug!(count = samples.len(), path = %self.path.display(), "snapshot written");
        Ok(samples.len())
    }

    /// Runs periodic snapshots until `shutdown` fires, then writes a final one.
    /// A zero `interval` skips the timer (the ingestion path snapshots instead).
    pub fn spawn(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if interval.is_zero() {
                shutdown.cancelled().await;
            } else {
                let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = self.snapshot().await {
                                warn!(error = %e, "snapshot failed, will retry next tick");
                            }
                        }
                    }
                }
            }

            match self.snapshot().await {
                Ok(count) => info!(count, "final snapshot written"),
                Err(e) => error!(error = %e, "final snapshot failed"),
            }
        })
    }
}

/// Accepts either one JSON array of records or a stream of records
/// (newline-delimited or simply concatenated).
pub fn parse_records(text: &str) -> Result<Vec<MetricSample>, serde_json::Error> {
    let trimmed = text.trim_start();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed);
    }
    serde_json::Deserializer::from_str(trimmed)
        .into_iter::<MetricSample>()
        .collect()
}

fn render_records(samples: &[MetricSample]) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = Vec::with_capacity(samples.len() * 48);
    for sample in samples {
        serde_json::to_writer(&mut buf, sample)?;
        buf.push(b'\n');
    }
    Ok(buf)
}

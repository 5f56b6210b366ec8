/**
 * HEALTH - Liveness, storage probe and collector self-report
 *
 * - GET /health         : process is up (no storage access)
 * - GET /ping           : storage backend answers within PING_TIMEOUT
 * - GET /system/health  : uptime, backend, ingestion counters, memory
 */

use crate::error::ApiError;
use crate::storage::MetricStore;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::warn;

pub const PING_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Serialize, Deserialize)]
pub struct CollectorHealth {
    pub uptime_seconds: u64,
    pub backend: String,
    pub metrics_stored: Option<u64>,
    pub samples_ingested: u64,
    pub requests_rejected: u64,
    pub memory_usage_mb: f32,
    pub checked_at: String,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    samples_ingested: Arc<AtomicU64>,
    requests_rejected: Arc<AtomicU64>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            samples_ingested: Arc::new(AtomicU64::new(0)),
            requests_rejected: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn record_ingested(&self, count: usize) {
        self.samples_ingested.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.requests_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn get_health(&self, store: &dyn MetricStore) -> CollectorHealth {
        // A failing backend must not fail the self-report.
        let metrics_stored = match store.list_all().await {
            Ok(all) => Some(all.len() as u64),
            Err(e) => {
                warn!(error = %e, "cannot count stored metrics");
                None
            }
        };

        CollectorHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            backend: store.backend().to_string(),
            metrics_stored,
            samples_ingested: self.samples_ingested.load(Ordering::Relaxed),
            requests_rejected: self.requests_rejected.load(Ordering::Relaxed),
            memory_usage_mb: get_memory_usage_mb(),
            checked_at: OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default(),
        }
    }
}

/// Storage probe behind `/ping`; a slow backend counts as unavailable.
pub async fn probe_storage(store: &dyn MetricStore, timeout: Duration) -> Result<(), ApiError> {
    match tokio::time::timeout(timeout, store.ping()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            warn!(backend = store.backend(), error = %e, "storage ping failed");
            Err(ApiError::StorageUnavailable)
        }
        Err(_) => {
            warn!(backend = store.backend(), timeout_ms = timeout.as_millis() as u64, "storage ping timed out");
            Err(ApiError::StorageUnavailable)
        }
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if let Some(rest) = line.strip_prefix("VmRSS:") {
                    if let Some(Ok(kb)) = rest.split_whitespace().next().map(str::parse::<u64>) {
                        return kb as f32 / 1024.0;
                    }
                }
            }
        }
    }
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, StoreError};
    use async_trait::async_trait;
    use vigil_protocol::MetricSample;

    /// Backend whose ping never answers.
    struct Stuck;

    #[async_trait]
    impl MetricStore for Stuck {
        fn backend(&self) -> &'static str {
            "stuck"
        }
        async fn get_gauge(&self, _: &str) -> Result<Option<f64>, StoreError> {
            Ok(None)
        }
        async fn get_counter(&self, _: &str) -> Result<Option<i64>, StoreError> {
            Ok(None)
        }
        async fn upsert_gauge(&self, _: &str, _: f64) -> Result<(), StoreError> {
            Ok(())
        }
        async fn upsert_counter(&self, _: &str, _: i64) -> Result<(), StoreError> {
            Ok(())
        }
        async fn list_all(&self) -> Result<Vec<MetricSample>, StoreError> {
            Err(StoreError::Database(sqlx::Error::PoolTimedOut))
        }
        async fn replace_all(&self, _: Vec<MetricSample>) -> Result<(), StoreError> {
            Ok(())
        }
        async fn batch_upsert(&self, _: &[MetricSample]) -> Result<(), StoreError> {
            Ok(())
        }
        async fn ping(&self) -> Result<(), StoreError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_probe_ok_and_timeout() {
        assert!(probe_storage(&MemoryStore::new(), PING_TIMEOUT).await.is_ok());
        assert!(matches!(
            probe_storage(&Stuck, Duration::from_millis(20)).await,
            Err(ApiError::StorageUnavailable)
        ));
    }

    #[tokio::test]
    async fn test_health_report_counts() {
        let tracker = HealthTracker::new();
        let store = MemoryStore::new();
        store.upsert_gauge("cpu", 1.0).await.unwrap();
        tracker.record_ingested(3);
        tracker.record_rejected();

        let health = tracker.get_health(&store).await;
        assert_eq!(health.backend, "memory");
        assert_eq!(health.metrics_stored, Some(1));
        assert_eq!(health.samples_ingested, 3);
        assert_eq!(health.requests_rejected, 1);

        assert_eq!(tracker.get_health(&Stuck).await.metrics_stored, None);
    }
}

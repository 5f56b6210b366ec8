/**
 * METRIC STORAGE - Unified persistence interface for the collector
 *
 * ROLE :
 * Every backend (in-memory, Postgres) exposes the same operations so the
 * ingestion path, the backup controller and the HTTP handlers never know
 * which one is running.
 *
 * SEMANTICS :
 * - gauge upsert: last write wins
 * - counter upsert: the delta is added to the stored sum (missing = 0)
 * - a name holds exactly one kind; writing the other kind is a KindConflict
 * - batch upsert: all samples applied, or none
 * - replace_all: used by restore only, the store ends up holding exactly the list
 */

pub mod memory;
pub mod migrations;
pub mod postgres;

use async_trait::async_trait;
use vigil_protocol::{MetricKind, MetricSample, ValidationError};

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use crate::retry::{self, Retriable};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("metric {name} is already stored as a {existing}")]
    KindConflict { name: String, existing: MetricKind },
    #[error("counter {name} would overflow")]
    Overflow { name: String },
    #[error("stored metric is invalid: {0}")]
    Invalid(#[from] ValidationError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl Retriable for StoreError {
    fn is_retriable(&self) -> bool {
        match self {
            StoreError::Database(e) => retry::is_retriable_db_error(e),
            _ => false,
        }
    }
}

#[async_trait]
pub trait MetricStore: Send + Sync {
    /// Short backend name for logs and health reports.
    fn backend(&self) -> &'static str;

    async fn get_gauge(&self, name: &str) -> Result<Option<f64>, StoreError>;

    async fn get_counter(&self, name: &str) -> Result<Option<i64>, StoreError>;

    async fn upsert_gauge(&self, name: &str, value: f64) -> Result<(), StoreError>;

    async fn upsert_counter(&self, name: &str, delta: i64) -> Result<(), StoreError>;

    /// Every stored metric, ordered by name.
    async fn list_all(&self) -> Result<Vec<MetricSample>, StoreError>;

    /// Replaces the whole store content with `samples` (later duplicates win).
    async fn replace_all(&self, samples: Vec<MetricSample>) -> Result<(), StoreError>;

    /// Applies every sample with upsert semantics, atomically.
    async fn batch_upsert(&self, samples: &[MetricSample]) -> Result<(), StoreError>;

    /// Backend reachability probe.
    async fn ping(&self) -> Result<(), StoreError>;

    async fn upsert(&self, sample: &MetricSample) -> Result<(), StoreError> {
        match sample.value {
            vigil_protocol::MetricValue::Gauge(v) => self.upsert_gauge(&sample.id, v).await,
            vigil_protocol::MetricValue::Counter(d) => self.upsert_counter(&sample.id, d).await,
        }
    }

    /// Current stored state of `name` as `kind`, if any.
    async fn get(&self, kind: MetricKind, name: &str) -> Result<Option<MetricSample>, StoreError> {
        Ok(match kind {
            MetricKind::Gauge => self.get_gauge(name).await?.map(|v| MetricSample::gauge(name, v)),
            MetricKind::Counter => self.get_counter(name).await?.map(|d| MetricSample::counter(name, d)),
        })
    }
}

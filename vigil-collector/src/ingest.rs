//! Ingestion path: envelope in, store mutation, response out.
//!
//! Each request walks `Received → Decoded → Validated → Applied → Responded`;
//! the first failing stage decides the rejection (decode and validation errors
//! are client errors, storage errors are server errors).

use crate::backup::BackupController;
use crate::error::ApiError;
use crate::health::HealthTracker;
use crate::storage::MetricStore;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, warn};
use vigil_protocol::{Envelope, EnvelopeCodec, MetricKind, MetricSample, WireMetric};

pub struct Ingestor {
    store: Arc<dyn MetricStore>,
    codec: Arc<EnvelopeCodec>,
    /// Set when the store interval is zero: snapshot after every write.
    sync_backup: Option<Arc<BackupController>>,
    health: HealthTracker,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn MetricStore>,
        codec: Arc<EnvelopeCodec>,
        sync_backup: Option<Arc<BackupController>>,
        health: HealthTracker,
    ) -> Self {
        Self { store, codec, sync_backup, health }
    }

    pub fn store(&self) -> &Arc<dyn MetricStore> {
        &self.store
    }

    /// `POST /update`: one structured sample.
    pub async fn ingest_one(&self, envelope: &Envelope) -> Result<MetricSample, ApiError> {
        let result = self.apply_one(envelope).await;
        self.tally(result)
    }

    /// `POST /updates`: a batch, applied all-or-nothing.
    pub async fn ingest_batch(&self, envelope: &Envelope) -> Result<usize, ApiError> {
        let result = self.apply_batch(envelope).await;
        self.tally(result)
    }

    /// `POST /update/{type}/{name}/{value}`. This form has no body to sign, so it
    /// is refused whenever signatures are required.
    pub async fn ingest_url(&self, kind: &str, name: &str, raw: &str) -> Result<MetricSample, ApiError> {
        let result = self.apply_url(kind, name, raw).await;
        self.tally(result)
    }

    /// `POST /value`: structured lookup, the body carries `id` and `type` only.
    pub async fn lookup(&self, envelope: &Envelope) -> Result<MetricSample, ApiError> {
        let wire: WireMetric = self.codec.decode(envelope)?;
        let (kind, name) = wire.key()?;
        self.value_of(kind, name).await
    }

    pub async fn value_of(&self, kind: MetricKind, name: &str) -> Result<MetricSample, ApiError> {
        self.store
            .get(kind, name)
            .await?
            .ok_or_else(|| ApiError::NotFound { kind, name: name.to_string() })
    }

    async fn apply_one(&self, envelope: &Envelope) -> Result<MetricSample, ApiError> {
        let wire: WireMetric = self.decode(envelope)?;
        let sample = MetricSample::try_from(wire)?;
        debug!(metric = %sample.id, kind = %sample.kind(), "validated");
        self.store.upsert(&sample).await?;
        self.after_write(1).await;
        Ok(sample)
    }

    async fn apply_batch(&self, envelope: &Envelope) -> Result<usize, ApiError> {
        let wires: Vec<WireMetric> = self.decode(envelope)?;
        let samples = wires
            .into_iter()
            .map(MetricSample::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        debug!(count = samples.len(), "batch validated");
        self.store.batch_upsert(&samples).await?;
        self.after_write(samples.len()).await;
        Ok(samples.len())
    }

    async fn apply_url(&self, kind: &str, name: &str, raw: &str) -> Result<MetricSample, ApiError> {
        if self.codec.signs() {
            return Err(ApiError::MissingSignature);
        }
        let sample = MetricSample::parse(kind, name, raw)?;
        self.store.upsert(&sample).await?;
        self.after_write(1).await;
        Ok(sample)
    }

    fn decode<T: DeserializeOwned>(&self, envelope: &Envelope) -> Result<T, ApiError> {
        if self.codec.signs() && envelope.signature.is_none() {
            return Err(ApiError::MissingSignature);
        }
        let payload = self.codec.decode(envelope)?;
        debug!(bytes = envelope.body.len(), encrypted = envelope.encrypted, "decoded");
        Ok(payload)
    }

    async fn after_write(&self, count: usize) {
        debug!(count, "applied");
        self.health.record_ingested(count);
        if let Some(backup) = &self.sync_backup {
            if let Err(e) = backup.snapshot().await {
                warn!(error = %e, "synchronous snapshot failed");
            }
        }
    }

    fn tally<T>(&self, result: Result<T, ApiError>) -> Result<T, ApiError> {
        if result.is_err() {
            self.health.record_rejected();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, StoreError};
    use vigil_protocol::EnvelopeKeys;

    fn ingestor(signing_key: Option<&[u8]>) -> Ingestor {
        let codec = EnvelopeCodec::new(EnvelopeKeys {
            signing_key: signing_key.map(<[u8]>::to_vec),
            ..Default::default()
        });
        Ingestor::new(Arc::new(MemoryStore::new()), Arc::new(codec), None, HealthTracker::new())
    }

    fn signed(key: &[u8]) -> EnvelopeCodec {
        EnvelopeCodec::new(EnvelopeKeys { signing_key: Some(key.to_vec()), ..Default::default() })
    }

    #[tokio::test]
    async fn test_single_then_lookup() {
        let ingestor = ingestor(None);
        let envelope = EnvelopeCodec::plain().encode(&MetricSample::gauge("cpu", 55.5)).unwrap();
        assert_eq!(ingestor.ingest_one(&envelope).await.unwrap(), MetricSample::gauge("cpu", 55.5));

        let query = EnvelopeCodec::plain()
            .encode(&serde_json::json!({"id": "cpu", "type": "gauge"}))
            .unwrap();
        assert_eq!(ingestor.lookup(&query).await.unwrap(), MetricSample::gauge("cpu", 55.5));
    }

    #[tokio::test]
    async fn test_batch_is_all_or_nothing_on_validation() {
        let ingestor = ingestor(None);
        let batch = serde_json::json!([
            {"id": "cpu", "type": "gauge", "value": 99.9},
            {"id": "req", "type": "counter"},
        ]);
        let envelope = EnvelopeCodec::plain().encode(&batch).unwrap();
        assert!(matches!(ingestor.ingest_batch(&envelope).await, Err(ApiError::Validation(_))));
        assert!(ingestor.store().list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_kind_conflict_surfaces_as_storage_error() {
        let ingestor = ingestor(None);
        ingestor.ingest_url("gauge", "x", "1").await.unwrap();
        let err = ingestor.ingest_url("counter", "x", "1").await.unwrap_err();
        assert!(matches!(err, ApiError::Storage(StoreError::KindConflict { .. })));
    }

    #[tokio::test]
    async fn test_unsigned_request_rejected_when_key_configured() {
        let ingestor = ingestor(Some(b"k"));
        let unsigned = EnvelopeCodec::plain().encode(&MetricSample::counter("hits", 1)).unwrap();
        assert!(matches!(ingestor.ingest_one(&unsigned).await, Err(ApiError::MissingSignature)));
        assert!(matches!(ingestor.ingest_url("counter", "hits", "1").await, Err(ApiError::MissingSignature)));

        let good = signed(b"k").encode(&MetricSample::counter("hits", 1)).unwrap();
        ingestor.ingest_one(&good).await.unwrap();

        let forged = signed(b"other").encode(&MetricSample::counter("hits", 1)).unwrap();
        assert!(matches!(ingestor.ingest_one(&forged).await, Err(ApiError::Decode(_))));
        assert_eq!(ingestor.store().get_counter("hits").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_missing_metric_is_not_found() {
        let ingestor = ingestor(None);
        assert!(matches!(
            ingestor.value_of(MetricKind::Counter, "nope").await,
            Err(ApiError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_sync_backup_after_each_write() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn MetricStore> = Arc::new(MemoryStore::new());
        let backup = Arc::new(BackupController::new(dir.path().join("backup"), store.clone()));
        let ingestor = Ingestor::new(
            store,
            Arc::new(EnvelopeCodec::plain()),
            Some(backup.clone()),
            HealthTracker::new(),
        );

        ingestor.ingest_url("counter", "hits", "5").await.unwrap();
        let text = std::fs::read_to_string(backup.path()).unwrap();
        assert_eq!(
            crate::backup::parse_records(&text).unwrap(),
            vec![MetricSample::counter("hits", 5)]
        );
    }
}

use crate::health::HealthTracker;
use crate::ingest::Ingestor;
use crate::storage::MetricStore;
use std::sync::Arc;

/// Everything a request handler can reach; cheap to clone per request.
#[derive(Clone)]
pub struct AppState {
    pub ingestor: Arc<Ingestor>,
    pub health_tracker: HealthTracker,
}

impl AppState {
    pub fn new(ingestor: Arc<Ingestor>, health_tracker: HealthTracker) -> Self {
        Self { ingestor, health_tracker }
    }

    pub fn store(&self) -> &dyn MetricStore {
        self.ingestor.store().as_ref()
    }
}

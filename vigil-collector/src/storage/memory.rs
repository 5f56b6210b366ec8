//! In-memory backend: two maps behind one lock.
//!
//! Gauges and counters live in separate maps, but a name may sit in only one of
//! them. Batches are staged against a read of the current state and written in
//! the same critical section, so a rejected batch leaves nothing behind.

use super::{MetricStore, StoreError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use vigil_protocol::{MetricSample, MetricValue};

#[derive(Debug, Default)]
struct Maps {
    gauges: HashMap<String, f64>,
    counters: HashMap<String, i64>,
}

impl Maps {
    fn get(&self, name: &str) -> Option<MetricValue> {
        self.gauges
            .get(name)
            .map(|v| MetricValue::Gauge(*v))
            .or_else(|| self.counters.get(name).map(|d| MetricValue::Counter(*d)))
    }

    fn set(&mut self, name: &str, value: MetricValue) {
        match value {
            MetricValue::Gauge(v) => {
                self.counters.remove(name);
                self.gauges.insert(name.to_string(), v);
            }
            MetricValue::Counter(d) => {
                self.gauges.remove(name);
                self.counters.insert(name.to_string(), d);
            }
        }
    }

    fn apply(&mut self, name: &str, incoming: MetricValue) -> Result<(), StoreError> {
        let next = merge(name, self.get(name), incoming)?;
        self.set(name, next);
        Ok(())
    }
}

/// Upsert rule for one name: gauges overwrite, counters accumulate.
fn merge(
    name: &str,
    current: Option<MetricValue>,
    incoming: MetricValue,
) -> Result<MetricValue, StoreError> {
    match (current, incoming) {
        (None, value) => Ok(value),
        (Some(MetricValue::Gauge(_)), MetricValue::Gauge(v)) => Ok(MetricValue::Gauge(v)),
        (Some(MetricValue::Counter(sum)), MetricValue::Counter(delta)) => sum
            .checked_add(delta)
            .map(MetricValue::Counter)
            .ok_or_else(|| StoreError::Overflow { name: name.to_string() }),
        (Some(existing), _) => Err(StoreError::KindConflict {
            name: name.to_string(),
            existing: existing.kind(),
        }),
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    maps: Mutex<Maps>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetricStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get_gauge(&self, name: &str) -> Result<Option<f64>, StoreError> {
        Ok(self.maps.lock().gauges.get(name).copied())
    }

    async fn get_counter(&self, name: &str) -> Result<Option<i64>, StoreError> {
        Ok(self.maps.lock().counters.get(name).copied())
    }

    async fn upsert_gauge(&self, name: &str, value: f64) -> Result<(), StoreError> {
        self.maps.lock().apply(name, MetricValue::Gauge(value))
    }

    async fn upsert_counter(&self, name: &str, delta: i64) -> Result<(), StoreError> {
        self.maps.lock().apply(name, MetricValue::Counter(delta))
    }

    async fn list_all(&self) -> Result<Vec<MetricSample>, StoreError> {
        let maps = self.maps.lock();
        let mut all: Vec<MetricSample> = maps
            .gauges
            .iter()
            .map(|(name, v)| MetricSample::gauge(name.clone(), *v))
            .chain(maps.counters.iter().map(|(name, d)| MetricSample::counter(name.clone(), *d)))
            .collect();
        drop(maps);
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn replace_all(&self, samples: Vec<MetricSample>) -> Result<(), StoreError> {
        let mut fresh = Maps::default();
        for sample in &samples {
            fresh.set(&sample.id, sample.value);
        }
        *self.maps.lock() = fresh;
        Ok(())
    }

    async fn batch_upsert(&self, samples: &[MetricSample]) -> Result<(), StoreError> {
        let mut maps = self.maps.lock();

        let mut staged: HashMap<&str, MetricValue> = HashMap::with_capacity(samples.len());
        for sample in samples {
            let current = staged.get(sample.id.as_str()).copied().or_else(|| maps.get(&sample.id));
            let next = merge(&sample.id, current, sample.value)?;
            staged.insert(sample.id.as_str(), next);
        }

        for (name, value) in staged {
            maps.set(name, value);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

//! Metric model shared by both sides of the pipeline.
//!
//! `MetricSample` is the validated, strongly typed form: the kind and the value
//! travel together in `MetricValue`, so a gauge can never carry a delta.
//! `WireMetric` is the loose record found on the wire and in backup files
//! (`{"id", "type", "value"?, "delta"?}`); turning one into the other is the
//! validation step.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Metric kind as spelled on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Gauge,
    Counter,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gauge" => Ok(MetricKind::Gauge),
            "counter" => Ok(MetricKind::Counter),
            other => Err(ValidationError::InvalidType(other.to_string())),
        }
    }
}

/// Observed value; the variant is the kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    /// Last-write-wins reading.
    Gauge(f64),
    /// Delta added to the running sum.
    Counter(i64),
}

impl MetricValue {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricValue::Gauge(_) => MetricKind::Gauge,
            MetricValue::Counter(_) => MetricKind::Counter,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Gauge(v) => write!(f, "{v}"),
            MetricValue::Counter(d) => write!(f, "{d}"),
        }
    }
}

/// One observed metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireMetric", into = "WireMetric")]
pub struct MetricSample {
    pub id: String,
    pub value: MetricValue,
}

impl MetricSample {
    pub fn gauge(id: impl Into<String>, value: f64) -> Self {
        Self { id: id.into(), value: MetricValue::Gauge(value) }
    }

    pub fn counter(id: impl Into<String>, delta: i64) -> Self {
        Self { id: id.into(), value: MetricValue::Counter(delta) }
    }

    pub fn kind(&self) -> MetricKind {
        self.value.kind()
    }

    /// Builds a sample from the URL form `/update/{type}/{name}/{value}`.
    pub fn parse(kind: &str, id: &str, raw: &str) -> Result<Self, ValidationError> {
        let kind: MetricKind = kind.parse()?;
        if id.is_empty() {
            return Err(ValidationError::EmptyId);
        }
        let value = match kind {
            MetricKind::Gauge => raw
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(MetricValue::Gauge),
            MetricKind::Counter => raw.parse::<i64>().ok().map(MetricValue::Counter),
        };
        let value = value.ok_or_else(|| ValidationError::InvalidValue(raw.to_string()))?;
        Ok(Self { id: id.to_string(), value })
    }
}

/// Wire/backup record. Field names are part of the protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMetric {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl WireMetric {
    /// Validates the `id` and `type` fields only (lookup requests carry no value).
    pub fn key(&self) -> Result<(MetricKind, &str), ValidationError> {
        let kind: MetricKind = self.kind.parse()?;
        if self.id.is_empty() {
            return Err(ValidationError::EmptyId);
        }
        Ok((kind, &self.id))
    }
}

impl TryFrom<WireMetric> for MetricSample {
    type Error = ValidationError;

    fn try_from(wire: WireMetric) -> Result<Self, Self::Error> {
        let (kind, _) = wire.key()?;
        let value = match (kind, wire.value, wire.delta) {
            (MetricKind::Gauge, Some(v), None) => MetricValue::Gauge(v),
            (MetricKind::Counter, None, Some(d)) => MetricValue::Counter(d),
            (_, Some(_), Some(_)) => return Err(ValidationError::Ambiguous { id: wire.id }),
            (kind, _, _) => {
                let field = match kind {
                    MetricKind::Gauge => "value",
                    MetricKind::Counter => "delta",
                };
                return Err(ValidationError::MissingValue { id: wire.id, kind, field });
            }
        };
        Ok(MetricSample { id: wire.id, value })
    }
}

impl From<MetricSample> for WireMetric {
    fn from(sample: MetricSample) -> Self {
        let (value, delta) = match sample.value {
            MetricValue::Gauge(v) => (Some(v), None),
            MetricValue::Counter(d) => (None, Some(d)),
        };
        WireMetric {
            id: sample.id,
            kind: sample.value.kind().as_str().to_string(),
            delta,
            value,
        }
    }
}

/// Reasons a structurally valid record is not an acceptable sample.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid metric type: {0}")]
    InvalidType(String),
    #[error("metric id is empty")]
    EmptyId,
    #[error("metric {id}: {kind} requires `{field}`")]
    MissingValue { id: String, kind: MetricKind, field: &'static str },
    #[error("metric {id}: both `value` and `delta` are set")]
    Ambiguous { id: String },
    #[error("invalid metric value: {0}")]
    InvalidValue(String),
}

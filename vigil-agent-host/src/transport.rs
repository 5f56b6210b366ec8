//! Outbound delivery of encoded envelopes.

use crate::delivery::DeliveryError;
use async_trait::async_trait;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use std::time::Duration;
use tracing::debug;
use vigil_protocol::{Envelope, ENCRYPTION_HEADER, ENCRYPTION_RSA, GZIP_ENCODING, HASH_HEADER};

/// One outbound call per envelope; no retries at this layer.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, envelope: &Envelope) -> Result<(), DeliveryError>;
}

/// Posts single samples to the collector's `/update` endpoint.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(address: &str, timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoint: endpoint_for(address) })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// `host:port` or a full base URL, to the `/update` URL.
fn endpoint_for(address: &str) -> String {
    let base = address.trim_end_matches('/');
    if base.starts_with("http://") || base.starts_with("https://") {
        format!("{base}/update")
    } else {
        format!("http://{base}/update")
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, envelope: &Envelope) -> Result<(), DeliveryError> {
        let mut req = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .body(envelope.body.clone());
        if envelope.compressed {
            req = req.header(CONTENT_ENCODING, GZIP_ENCODING);
        }
        if envelope.encrypted {
            req = req.header(ENCRYPTION_HEADER, ENCRYPTION_RSA);
        }
        if let Some(signature) = &envelope.signature {
            req = req.header(HASH_HEADER, signature.as_str());
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DeliveryError::Rejected { status: status.as_u16(), body: body.trim().to_string() });
        }
        debug!("Delivered {} bytes ({})", envelope.body.len(), status);
        Ok(())
    }
}

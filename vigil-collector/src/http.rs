/**
 * HTTP API - Collector endpoints
 *
 * ROUTES :
 * - POST /update                        : one structured sample (envelope body)
 * - POST /update/{kind}/{name}/{value}  : URL form, text/plain answer
 * - POST /updates                       : batch, applied atomically
 * - POST /value                         : structured lookup {id, type}
 * - GET  /value/{kind}/{name}           : plain-text value
 * - GET  /                              : every metric, one `name: value` line each
 * - GET  /ping                          : storage probe (1s timeout)
 * - GET  /health, /system/health        : liveness and self-report
 *
 * Envelope flags come from headers: Content-Encoding (gzip), Content-Encryption
 * (RSA) and HashSHA256 (hex HMAC of the plaintext). Every request is traced in a
 * span carrying a fresh request id.
 *
 * Request bodies are capped at BODY_LIMIT on the wire (the codec separately caps
 * the inflated plaintext). Responses are gzipped when the client sends
 * `Accept-Encoding: gzip`.
 */

use crate::error::ApiError;
use crate::health::{probe_storage, CollectorHealth, PING_TIMEOUT};
use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Request, State};
use axum::http::header::CONTENT_ENCODING;
use axum::http::HeaderMap;
use axum::response::Html;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::fmt::Write;
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;
use vigil_protocol::{Envelope, MetricKind, MetricSample, ENCRYPTION_HEADER, HASH_HEADER};

/// Largest accepted request body, before decompression.
pub const BODY_LIMIT: usize = 2 * 1024 * 1024;

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(list_metrics))
        .route("/update", post(update_json))
        .route("/update/{kind}/{name}/{value}", post(update_url))
        .route("/updates", post(update_batch))
        .route("/value", post(value_json))
        .route("/value/{kind}/{name}", get(value_url))
        .route("/ping", get(ping))
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .with_state(app_state)
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(CompressionLayer::new().gzip(true))
        .layer(TraceLayer::new_for_http().make_span_with(|req: &Request| {
            tracing::info_span!(
                "request",
                request_id = %Uuid::new_v4(),
                method = %req.method(),
                path = %req.uri().path(),
            )
        }))
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn envelope_from(headers: &HeaderMap, body: Bytes) -> Envelope {
    Envelope::from_parts(
        body.to_vec(),
        header(headers, CONTENT_ENCODING.as_str()),
        header(headers, ENCRYPTION_HEADER),
        header(headers, HASH_HEADER),
    )
}

// POST /update
async fn update_json(
    State(app): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<MetricSample>, ApiError> {
    let sample = app.ingestor.ingest_one(&envelope_from(&headers, body)).await?;
    Ok(Json(sample))
}

// POST /update/{kind}/{name}/{value}
async fn update_url(
    State(app): State<AppState>,
    Path((kind, name, value)): Path<(String, String, String)>,
) -> Result<&'static str, ApiError> {
    app.ingestor.ingest_url(&kind, &name, &value).await?;
    Ok("")
}

// POST /updates
async fn update_batch(
    State(app): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    app.ingestor.ingest_batch(&envelope_from(&headers, body)).await?;
    Ok(Json(serde_json::json!({})))
}

// POST /value
async fn value_json(
    State(app): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<MetricSample>, ApiError> {
    let sample = app.ingestor.lookup(&envelope_from(&headers, body)).await?;
    Ok(Json(sample))
}

// GET /value/{kind}/{name}
async fn value_url(
    State(app): State<AppState>,
    Path((kind, name)): Path<(String, String)>,
) -> Result<String, ApiError> {
    let kind: MetricKind = kind.parse()?;
    let sample = app.ingestor.value_of(kind, &name).await?;
    Ok(sample.value.to_string())
}

// GET /
async fn list_metrics(State(app): State<AppState>) -> Result<Html<String>, ApiError> {
    let all = app.store().list_all().await?;
    let mut page = String::with_capacity(all.len() * 24);
    for sample in &all {
        let _ = writeln!(page, "{}: {}", sample.id, sample.value);
    }
    Ok(Html(page))
}

// GET /ping
async fn ping(State(app): State<AppState>) -> Result<&'static str, ApiError> {
    probe_storage(app.store(), PING_TIMEOUT).await?;
    Ok("ok")
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<CollectorHealth> {
    Json(app.health_tracker.get_health(app.store()).await)
}

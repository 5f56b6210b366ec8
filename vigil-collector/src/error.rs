//! Request-level errors and their HTTP status mapping.

use crate::storage::StoreError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{debug, error, warn};
use vigil_protocol::{CodecError, MetricKind, ValidationError};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("cannot decode request: {0}")]
    Decode(#[from] CodecError),
    #[error("request is not signed")]
    MissingSignature,
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{kind} {name} not found")]
    NotFound { kind: MetricKind, name: String },
    #[error("storage error: {0}")]
    Storage(StoreError),
    #[error("storage is not available")]
    StorageUnavailable,
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Storage(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Decode(_) | ApiError::MissingSignature | ApiError::Validation(_) => {
                StatusCode::BAD_REQUEST
            }
            // Client wrote a name with the wrong kind, or an unrepresentable sum.
            ApiError::Storage(StoreError::KindConflict { .. } | StoreError::Overflow { .. }) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::Storage(_) | ApiError::StorageUnavailable => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match status {
            s if s.is_server_error() => error!(error = %self, "request failed"),
            StatusCode::NOT_FOUND => debug!(error = %self, "request rejected"),
            _ => warn!(error = %self, "request rejected"),
        }
        (status, self.to_string()).into_response()
    }
}

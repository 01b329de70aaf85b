//! Local control API
//!
//! Loopback HTTP surface over [`SyncService`] so a UI shell (or an
//! operator with curl) can drive the engine:
//! - Status and queue counts
//! - Result/checklist edits and photo capture
//! - Hydration, manual sync, dead-letter handling

pub mod routes;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, patch, post},
    Router,
};
use std::sync::Arc;

use crate::error::{CaptureError, HydrationError, QueueError, StoreError};
use crate::service::SyncService;

pub type SharedService = Arc<SyncService>;

/// Create the control API router
pub fn create_router(service: SharedService) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/api/status", get(routes::api_status))
        .route("/api/sync", post(routes::api_sync))
        .route("/api/uploads", post(routes::api_upload_pending))
        .route("/api/connectivity", post(routes::api_set_connectivity))
        // Local edits
        .route("/api/results/:id", patch(routes::api_update_result))
        .route("/api/results/:id/evidence", post(routes::api_capture).get(routes::api_result_evidence))
        .route("/api/checklists/:id", patch(routes::api_update_checklist))
        .route("/api/evidence/:id", get(routes::api_load_evidence))
        // Hydration
        .route("/api/projects/:id/hydrate", post(routes::api_hydrate))
        // Dead letters
        .route("/api/mutations/dead", get(routes::api_dead_mutations))
        .route("/api/mutations/:id/retry", post(routes::api_retry_dead))
        .route("/api/mutations/:id", axum::routing::delete(routes::api_discard_dead))
        .with_state(service)
}

/// Error body returned by every handler
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let status = match &e {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::StorageFull => StatusCode::INSUFFICIENT_STORAGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl From<CaptureError> for ApiError {
    fn from(e: CaptureError) -> Self {
        match e {
            CaptureError::UnknownResult(_) => Self::new(StatusCode::NOT_FOUND, e.to_string()),
            CaptureError::EmptyBinary => Self::new(StatusCode::BAD_REQUEST, e.to_string()),
            CaptureError::StorageExhausted { .. } => {
                Self::new(StatusCode::INSUFFICIENT_STORAGE, e.to_string())
            }
            CaptureError::Store(inner) => inner.into(),
        }
    }
}

impl From<HydrationError> for ApiError {
    fn from(e: HydrationError) -> Self {
        match e {
            HydrationError::Network(_) => Self::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
            HydrationError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, e.to_string()),
            HydrationError::Rejected(_) => Self::new(StatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
            HydrationError::Store(inner) => inner.into(),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, e.to_string()),
            QueueError::NotDead(_) => Self::new(StatusCode::CONFLICT, e.to_string()),
            QueueError::Store(inner) => inner.into(),
        }
    }
}

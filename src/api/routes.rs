//! Control API handlers

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};

use super::{ApiError, SharedService};
use crate::evidence::CaptureMetadata;
use crate::hydration::HydrationStats;
use crate::model::{EvidenceBlob, EvidenceRef, GeoPoint, PhotoRef, QuantitativeFields, ResultStatus};
use crate::service::ResultChange;
use crate::sync::{ChecklistPatch, EnqueueOutcome, Mutation, MutationId, QueueCounts, SyncReport};

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    "OK"
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub online: bool,
    pub syncing: bool,
    pub queue: QueueCounts,
}

/// GET /api/status
pub async fn api_status(State(service): State<SharedService>) -> Result<Json<StatusResponse>, ApiError> {
    Ok(Json(StatusResponse {
        online: service.is_online(),
        syncing: service.is_syncing(),
        queue: service.queue_counts()?,
    }))
}

/// POST /api/sync - recheck reachability and drain the queue
pub async fn api_sync(State(service): State<SharedService>) -> Json<SyncReport> {
    Json(service.sync_now().await)
}

/// POST /api/uploads
pub async fn api_upload_pending(State(service): State<SharedService>) -> Result<Json<SyncReport>, ApiError> {
    Ok(Json(service.upload_pending().await?))
}

#[derive(Debug, Deserialize)]
pub struct ConnectivityRequest {
    pub online: bool,
}

/// POST /api/connectivity - link-layer signal from the platform
pub async fn api_set_connectivity(
    State(service): State<SharedService>,
    Json(req): Json<ConnectivityRequest>,
) -> Json<StatusResponse> {
    service.set_link_online(req.online);
    Json(StatusResponse {
        online: service.is_online(),
        syncing: service.is_syncing(),
        queue: service.queue_counts().unwrap_or_default(),
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateResultRequest {
    #[serde(default)]
    pub status: Option<ResultStatus>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub photos: Option<Vec<PhotoRef>>,
    #[serde(default)]
    pub quantitative: Option<QuantitativeFields>,
}

/// PATCH /api/results/:id
pub async fn api_update_result(
    State(service): State<SharedService>,
    Path(result_id): Path<String>,
    Json(req): Json<UpdateResultRequest>,
) -> Result<(StatusCode, Json<EnqueueOutcome>), ApiError> {
    let change = ResultChange {
        status: req.status,
        comment: req.comment,
        photos: req.photos,
        quantitative: req.quantitative,
    };
    let outcome = service.update_result(&result_id, change)?;
    Ok((StatusCode::ACCEPTED, Json(outcome)))
}

/// PATCH /api/checklists/:id
pub async fn api_update_checklist(
    State(service): State<SharedService>,
    Path(checklist_id): Path<String>,
    Json(patch): Json<ChecklistPatch>,
) -> Result<(StatusCode, Json<EnqueueOutcome>), ApiError> {
    if patch.is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "Checklist patch is empty"));
    }
    let outcome = service.update_checklist(&checklist_id, patch)?;
    Ok((StatusCode::ACCEPTED, Json(outcome)))
}

#[derive(Debug, Deserialize)]
pub struct CaptureQuery {
    pub project_id: String,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
    #[serde(default)]
    pub requirement_clause: Option<String>,
    #[serde(default)]
    pub project_name: Option<String>,
}

/// POST /api/results/:id/evidence?project_id=... - raw image bytes in the body
pub async fn api_capture(
    State(service): State<SharedService>,
    Path(result_id): Path<String>,
    Query(query): Query<CaptureQuery>,
    body: Bytes,
) -> Result<(StatusCode, Json<EvidenceRef>), ApiError> {
    let geolocation = match (query.lat, query.lon) {
        (Some(latitude), Some(longitude)) => Some(GeoPoint { latitude, longitude }),
        _ => None,
    };
    let metadata = CaptureMetadata {
        project_id: query.project_id,
        captured_at: None,
        geolocation,
        requirement_clause: query.requirement_clause,
        project_name: query.project_name,
    };
    let evidence = service.capture(&result_id, body.to_vec(), metadata).await?;
    Ok((StatusCode::CREATED, Json(evidence)))
}

/// GET /api/results/:id/evidence
pub async fn api_result_evidence(
    State(service): State<SharedService>,
    Path(result_id): Path<String>,
) -> Result<Json<Vec<EvidenceBlob>>, ApiError> {
    Ok(Json(service.evidence_for_result(&result_id)?))
}

/// GET /api/evidence/:id - the stored binary, renderable before upload
pub async fn api_load_evidence(
    State(service): State<SharedService>,
    Path(evidence_id): Path<String>,
) -> Result<Response, ApiError> {
    let blob = service
        .load_evidence(&evidence_id)?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("Evidence not found: {}", evidence_id)))?;
    Ok(([(header::CONTENT_TYPE, blob.content_type)], blob.binary).into_response())
}

/// POST /api/projects/:id/hydrate
pub async fn api_hydrate(
    State(service): State<SharedService>,
    Path(project_id): Path<String>,
) -> Result<Json<HydrationStats>, ApiError> {
    Ok(Json(service.hydrate_project(&project_id).await?))
}

/// GET /api/mutations/dead
pub async fn api_dead_mutations(State(service): State<SharedService>) -> Result<Json<Vec<Mutation>>, ApiError> {
    Ok(Json(service.dead_mutations()?))
}

/// POST /api/mutations/:id/retry
pub async fn api_retry_dead(
    State(service): State<SharedService>,
    Path(id): Path<i64>,
) -> Result<Json<Mutation>, ApiError> {
    Ok(Json(service.retry_dead(MutationId(id))?))
}

/// DELETE /api/mutations/:id - only dead mutations can be discarded
pub async fn api_discard_dead(
    State(service): State<SharedService>,
    Path(id): Path<i64>,
) -> Result<Json<Mutation>, ApiError> {
    Ok(Json(service.discard_dead(MutationId(id))?))
}

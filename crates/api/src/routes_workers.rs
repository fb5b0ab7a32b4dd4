//! Worker-facing endpoints: liveness beacon, work pulling and the job
//! lifecycle calls made by executing workers.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use conductor_engine::FailKind;
use conductor_store::Store;

use crate::app::Services;
use crate::errors::ApiError;
use crate::routes_jobs::parse_job_id;

#[derive(Debug, Deserialize)]
pub struct HeartbeatBody {
    pub hostname: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ClaimBody {
    pub queue: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LeaseBody {
    pub worker_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ProgressBody {
    pub worker_id: String,
    #[serde(default)]
    pub data: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
pub struct FailBody {
    pub worker_id: String,
    pub error: Option<String>,
    pub kind: Option<FailKind>,
}

/// Worker liveness beacon; registers unknown workers on first contact.
pub async fn heartbeat<S: Store>(
    State(svc): State<Arc<Services<S>>>,
    Path(worker_id): Path<String>,
    body: Option<Json<HeartbeatBody>>,
) -> Result<Response, ApiError> {
    let hostname = body.as_ref().and_then(|b| b.hostname.clone());
    svc.registry
        .heartbeat(&worker_id, hostname.as_deref())
        .await?;
    Ok(Json(json!({"ok": true})).into_response())
}

/// Single-shot work pull: 200 with the claimed job, or 204 when the queue
/// is empty, capped out, or blocked on dataset locks.
pub async fn claim<S: Store>(
    State(svc): State<Arc<Services<S>>>,
    Path(worker_id): Path<String>,
    body: Option<Json<ClaimBody>>,
) -> Result<Response, ApiError> {
    let queue = body
        .and_then(|b| b.0.queue)
        .unwrap_or_else(|| "default".to_string());

    // Pulling counts as a liveness signal.
    svc.registry.heartbeat(&worker_id, None).await?;

    match svc.scheduler.claim_next_job(&queue, &worker_id).await? {
        Some(job) => Ok((StatusCode::OK, Json(job)).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

/// Lease renewal. `renewed = false` means the lease is gone; the worker
/// should stop. `cancel_requested` rides along so workers see cancels
/// without a progress round-trip.
pub async fn lease<S: Store>(
    State(svc): State<Arc<Services<S>>>,
    Path(id): Path<String>,
    Json(body): Json<LeaseBody>,
) -> Result<Response, ApiError> {
    let id = parse_job_id(&id)?;
    let beat = svc.lifecycle.heartbeat(id, &body.worker_id).await?;
    Ok(Json(json!({
        "renewed": beat.renewed,
        "status": beat.status,
        "cancel_requested": beat.cancel_requested,
    }))
    .into_response())
}

pub async fn progress<S: Store>(
    State(svc): State<Arc<Services<S>>>,
    Path(id): Path<String>,
    Json(body): Json<ProgressBody>,
) -> Result<Response, ApiError> {
    let id = parse_job_id(&id)?;
    let beat = svc
        .lifecycle
        .progress(id, &body.worker_id, body.data.unwrap_or(JsonValue::Null))
        .await?;
    Ok(Json(json!({
        "status": beat.status,
        "cancel_requested": beat.cancel_requested,
    }))
    .into_response())
}

pub async fn complete<S: Store>(
    State(svc): State<Arc<Services<S>>>,
    Path(id): Path<String>,
    Json(body): Json<LeaseBody>,
) -> Result<Response, ApiError> {
    let id = parse_job_id(&id)?;
    let job = svc.lifecycle.complete(id, &body.worker_id).await?;
    Ok(Json(job).into_response())
}

pub async fn fail<S: Store>(
    State(svc): State<Arc<Services<S>>>,
    Path(id): Path<String>,
    Json(body): Json<FailBody>,
) -> Result<Response, ApiError> {
    let id = parse_job_id(&id)?;
    let error = body
        .error
        .unwrap_or_else(|| "worker reported failure".to_string());
    let job = svc
        .lifecycle
        .fail(id, &body.worker_id, &error, body.kind.unwrap_or_default())
        .await?;
    Ok(Json(job).into_response())
}

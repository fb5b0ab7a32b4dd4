//! Job CRUD, lifecycle verbs and the scheduler snapshot.

use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value as JsonValue;

use conductor_core::{CoreError, JobId, NewJob};
use conductor_store::Store;

use crate::app::Services;
use crate::errors::ApiError;

const LIST_LIMIT: usize = 50;

pub(crate) fn parse_job_id(s: &str) -> Result<JobId, ApiError> {
    JobId::from_str(s)
        .map_err(|_| CoreError::validation(format!("invalid job id: {s}")).into())
}

pub async fn create_job<S: Store>(
    State(svc): State<Arc<Services<S>>>,
    Json(body): Json<JsonValue>,
) -> Result<Response, ApiError> {
    let new: NewJob = serde_json::from_value(body)
        .map_err(|e| CoreError::validation(format!("invalid job body: {e}")))?;
    let job = svc.lifecycle.submit(new).await?;
    Ok((StatusCode::CREATED, Json(job)).into_response())
}

pub async fn list_jobs<S: Store>(
    State(svc): State<Arc<Services<S>>>,
) -> Result<Response, ApiError> {
    let jobs = svc.lifecycle.list(LIST_LIMIT).await?;
    Ok(Json(jobs).into_response())
}

/// The job with its full event trail embedded.
pub async fn get_job<S: Store>(
    State(svc): State<Arc<Services<S>>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_job_id(&id)?;
    let job = svc.lifecycle.get(id).await?;
    let events = svc.lifecycle.events(id).await?;

    let mut body = serde_json::to_value(&job)
        .map_err(|e| CoreError::internal(e.to_string()))?;
    body["events"] =
        serde_json::to_value(&events).map_err(|e| CoreError::internal(e.to_string()))?;
    Ok(Json(body).into_response())
}

/// Idempotent: cancelling a terminal job returns its current state with 200.
pub async fn cancel_job<S: Store>(
    State(svc): State<Arc<Services<S>>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_job_id(&id)?;
    let outcome = svc.lifecycle.cancel(id).await?;
    Ok(Json(outcome.job).into_response())
}

pub async fn retry_job<S: Store>(
    State(svc): State<Arc<Services<S>>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_job_id(&id)?;
    let job = svc.lifecycle.retry(id).await?;
    Ok(Json(job).into_response())
}

pub async fn pause_job<S: Store>(
    State(svc): State<Arc<Services<S>>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_job_id(&id)?;
    let job = svc.lifecycle.pause(id).await?;
    Ok(Json(job).into_response())
}

pub async fn resume_job<S: Store>(
    State(svc): State<Arc<Services<S>>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_job_id(&id)?;
    let job = svc.lifecycle.resume(id).await?;
    Ok(Json(job).into_response())
}

pub async fn scheduler_snapshot<S: Store>(
    State(svc): State<Arc<Services<S>>>,
) -> Result<Response, ApiError> {
    let snapshot = svc.scheduler.snapshot().await?;
    Ok(Json(snapshot).into_response())
}

//! REST surface: job submission/administration plus the provider callback
//! endpoint.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::warn;
use uuid::Uuid;

use crate::error::{CallbackError, DispatchError, Error, JobError};
use crate::model::{CallbackRequest, JobStatus, ProviderId};
use crate::orchestrator::Orchestrator;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Build the Axum router with job REST and callback routes.
pub fn job_routes(orchestrator: Arc<Orchestrator>) -> Router {
    let state = AppState { orchestrator };

    Router::new()
        .route("/health", get(health))
        .route("/api/jobs", post(submit_job).get(list_jobs))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/cancel", post(cancel_job))
        .route("/api/jobs/{id}/retry", post(retry_job))
        .route("/jobs/{id}/callback", post(job_callback))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "newsflow-orchestrator"
    }))
}

// ── Jobs ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitJobRequest {
    topic: String,
    #[serde(default)]
    context_url: Option<String>,
    task_type: String,
    providers: Vec<String>,
}

async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<SubmitJobRequest>,
) -> impl IntoResponse {
    let mut providers = Vec::with_capacity(request.providers.len());
    for raw in &request.providers {
        match ProviderId::parse(raw) {
            Some(provider) => providers.push(provider),
            None => {
                return error_response(Error::Dispatch(DispatchError::UnknownProvider(
                    raw.clone(),
                )));
            }
        }
    }

    match state
        .orchestrator
        .submit(
            request.topic,
            request.context_url,
            request.task_type,
            providers,
        )
        .await
    {
        Ok(job_id) => (
            StatusCode::CREATED,
            Json(serde_json::json!({"jobId": job_id})),
        ),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct ListJobsQuery {
    status: Option<String>,
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> impl IntoResponse {
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => match JobStatus::parse(raw) {
            Some(status) => Some(status),
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({"error": format!("unknown status: {raw}")})),
                );
            }
        },
    };

    match state.orchestrator.list_jobs(status).await {
        Ok(jobs) => (StatusCode::OK, Json(serde_json::json!({"jobs": jobs}))),
        Err(e) => error_response(e),
    }
}

async fn get_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    match state.orchestrator.get_job(id).await {
        Ok(details) => (StatusCode::OK, Json(serde_json::json!(details))),
        Err(e) => error_response(e),
    }
}

async fn cancel_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    match state.orchestrator.cancel(id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({"jobId": id, "status": JobStatus::Cancelled})),
        ),
        Err(e) => error_response(e),
    }
}

async fn retry_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    match state.orchestrator.retry_failed(id).await {
        Ok(retried) => (
            StatusCode::OK,
            Json(serde_json::json!({"jobId": id, "retried": retried})),
        ),
        Err(e) => error_response(e),
    }
}

// ── Provider callback ───────────────────────────────────────────────────

async fn job_callback(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<CallbackRequest>,
) -> impl IntoResponse {
    match state.orchestrator.ingest_for_job(id, request).await {
        // Duplicates and late arrivals are acknowledged so the worker stops
        // retrying.
        Ok(outcome) => (
            StatusCode::OK,
            Json(serde_json::json!({"jobId": id, "outcome": format!("{outcome:?}")})),
        ),
        Err(e) => error_response(e),
    }
}

// ── Error mapping ───────────────────────────────────────────────────────

fn error_response(e: Error) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &e {
        Error::Callback(CallbackError::TokenMismatch(_)) => StatusCode::UNAUTHORIZED,
        Error::Callback(CallbackError::UnknownSubTask(_)) => StatusCode::NOT_FOUND,
        Error::Callback(CallbackError::InvalidStatus(_)) => StatusCode::BAD_REQUEST,
        Error::Job(JobError::NotFound(_)) => StatusCode::NOT_FOUND,
        Error::Job(JobError::AlreadyTerminal { .. }) => StatusCode::CONFLICT,
        Error::Job(JobError::NothingToRetry(_)) => StatusCode::CONFLICT,
        Error::Dispatch(DispatchError::EmptyProviderList) => StatusCode::BAD_REQUEST,
        Error::Dispatch(DispatchError::UnknownProvider(_)) => StatusCode::BAD_REQUEST,
        _ => {
            warn!(error = %e, "Request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(serde_json::json!({"error": e.to_string()})))
}

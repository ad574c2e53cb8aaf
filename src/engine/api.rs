use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::broadcaster::LogBroadcaster;
use super::db::DbHandle;
use super::models::{ArtifactSummary, ContractView, Language, SubmitJob};
use super::orchestrator::Orchestrator;
use super::ws;
use crate::errors::{InvalidRequest, StoreError};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub logs: Arc<LogBroadcaster>,
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            db: orchestrator.db().clone(),
            logs: orchestrator.logs().clone(),
            orchestrator,
        }
    }
}

pub type SharedState = Arc<AppState>;

// ── Request / response payloads ───────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub job_id: Uuid,
}

#[derive(Deserialize, Default)]
pub struct ArtifactQuery {
    #[serde(default)]
    pub history: bool,
}

#[derive(Deserialize, Default)]
pub struct ValidationQuery {
    pub round: Option<u32>,
}

/// Full artifact as served by the detail endpoint.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactDetail {
    #[serde(flatten)]
    pub summary: ArtifactSummary,
    pub file_name: String,
    pub language: Language,
    pub checksum: String,
    pub content: String,
    pub compiler_output: Option<String>,
    pub validated_at: Option<DateTime<Utc>>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(invalid) = err.downcast_ref::<InvalidRequest>() {
            return ApiError::BadRequest(invalid.0.clone());
        }
        match err.downcast_ref::<StoreError>() {
            Some(StoreError::JobNotFound(_) | StoreError::ArtifactNotFound(_)) => ApiError::NotFound(err.to_string()),
            Some(_) => ApiError::Conflict(err.to_string()),
            None => ApiError::Internal(err.to_string()),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/jobs", post(submit_job))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/logs", get(ws::job_logs))
        .route("/api/jobs/{id}/artifacts", get(list_artifacts))
        .route("/api/jobs/{id}/artifacts/{artifact_id}", get(get_artifact))
        .route("/api/jobs/{id}/contract", get(get_contract))
        .route("/api/jobs/{id}/cancel", post(cancel_job))
        .route("/api/jobs/{id}/validations", get(list_validations))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn submit_job(
    State(state): State<SharedState>,
    Json(req): Json<SubmitJob>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.orchestrator.submit(req).await?;
    Ok((StatusCode::CREATED, Json(SubmitResponse { job_id: job.id })))
}

async fn get_job(State(state): State<SharedState>, Path(id): Path<Uuid>) -> Result<impl IntoResponse, ApiError> {
    let job = state.db.call(move |db| db.require_job(id)).await?;
    Ok(Json(job.view()))
}

async fn list_artifacts(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ArtifactQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let artifacts = state
        .db
        .call(move |db| {
            db.require_job(id)?;
            if query.history {
                db.list_artifacts(id)
            } else {
                db.latest_artifacts(id)
            }
        })
        .await?;
    let summaries: Vec<ArtifactSummary> = artifacts.iter().map(|a| a.summary()).collect();
    Ok(Json(summaries))
}

async fn get_artifact(
    State(state): State<SharedState>,
    Path((id, artifact_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, ApiError> {
    let artifact = state.db.call(move |db| db.require_artifact(artifact_id)).await?;
    if artifact.job_id != id {
        return Err(ApiError::NotFound(format!("Artifact {} not found in job {}", artifact_id, id)));
    }
    Ok(Json(ArtifactDetail {
        summary: artifact.summary(),
        compiler_output: artifact.validity.compiler_output().map(str::to_string),
        file_name: artifact.file_name,
        language: artifact.language,
        checksum: artifact.checksum,
        content: artifact.content,
        validated_at: artifact.validated_at,
    }))
}

async fn get_contract(State(state): State<SharedState>, Path(id): Path<Uuid>) -> Result<impl IntoResponse, ApiError> {
    let job = state.db.call(move |db| db.require_job(id)).await?;
    let contract = job
        .contract
        .as_ref()
        .ok_or_else(|| ApiError::NotFound(format!("Job {} has no contract yet", id)))?;
    Ok(Json(ContractView::from(contract)))
}

async fn cancel_job(State(state): State<SharedState>, Path(id): Path<Uuid>) -> Result<impl IntoResponse, ApiError> {
    let job = state.orchestrator.cancel(id).await?;
    Ok(Json(job.view()))
}

async fn list_validations(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ValidationQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let results = state
        .db
        .call(move |db| {
            db.require_job(id)?;
            db.validation_results(id, query.round)
        })
        .await?;
    Ok(Json(results))
}

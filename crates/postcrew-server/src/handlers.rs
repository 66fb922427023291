//! HTTP handlers for the `/api` surface.
//!
//! Every failure renders as `{"error": {"code", "message"}}`.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use postcrew_core::ids::{ProjectId, RunId};
use postcrew_engine::AgentInvoker;
use postcrew_store::drafts::DraftRepo;
use postcrew_store::findings::FindingRepo;
use postcrew_store::projects::{NewProject, ProjectRepo};
use postcrew_store::reports::ReportRepo;
use postcrew_store::runs::RunRepo;
use postcrew_store::steps::StepRepo;
use postcrew_store::templates::{NewTemplate, TemplateRepo};
use postcrew_store::{Database, StoreError};
use postcrew_telemetry::{LogQuery, LogRecord, SqliteLogSink};

use crate::bridge::FanoutBridge;
use crate::client::ClientRegistry;
use crate::orchestrator::{OrchestratorError, RunOrchestrator};
use crate::subscriptions::SubscriptionRegistry;

const PROJECT_LIST_LIMIT: u32 = 100;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub orchestrator: Arc<RunOrchestrator>,
    pub clients: Arc<ClientRegistry>,
    pub subscriptions: Arc<SubscriptionRegistry>,
    pub bridge: Arc<FanoutBridge>,
    pub logs: Option<Arc<SqliteLogSink>>,
    /// Shared with the workflow; serves direct agent invocations.
    pub invoker: Arc<dyn AgentInvoker>,
    pub invoke_timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    InvalidParams(String),
    #[error("{0}")]
    InvalidState(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Conflict(_) | Self::InvalidState(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidParams(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Conflict(_) => "CONFLICT",
            Self::NotFound(_) => "NOT_FOUND",
            Self::InvalidParams(_) => "INVALID_PARAMS",
            Self::InvalidState(_) => "INVALID_STATE",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        });
        (self.status(), Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(msg) => Self::NotFound(msg),
            StoreError::Conflict(msg) => Self::Conflict(msg),
            other => {
                tracing::error!(error = %other, "store failure");
                Self::Internal(other.to_string())
            }
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        match e {
            OrchestratorError::Conflict(msg) => Self::Conflict(msg),
            OrchestratorError::NotFound(msg) => Self::NotFound(msg),
            OrchestratorError::InvalidState(msg) => Self::InvalidState(msg),
            OrchestratorError::Store(e) => e.into(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::InvalidParams(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::InvalidParams(rejection.body_text())
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "active_runs": state.orchestrator.active_count(),
        "connections": state.clients.count(),
        "channels": state.bridge.channel_count(),
    }))
}

pub async fn create_template(
    State(state): State<AppState>,
    payload: Result<Json<NewTemplate>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(template) = payload?;
    if template.name.trim().is_empty() {
        return Err(ApiError::InvalidParams("name must not be empty".into()));
    }
    if template.structure_prompt.trim().is_empty() {
        return Err(ApiError::InvalidParams("structure_prompt must not be empty".into()));
    }
    let row = TemplateRepo::new(state.db.clone()).create(&template)?;
    Ok((StatusCode::CREATED, Json(row)))
}

pub async fn list_templates(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(TemplateRepo::new(state.db.clone()).list()?))
}

pub async fn create_project(
    State(state): State<AppState>,
    payload: Result<Json<NewProject>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(project) = payload?;
    project.validate().map_err(ApiError::InvalidParams)?;
    let row = ProjectRepo::new(state.db.clone()).create(&project)?;
    tracing::info!(project_id = %row.id, topic = %row.topic, "project created");
    Ok((StatusCode::CREATED, Json(row)))
}

pub async fn list_projects(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(ProjectRepo::new(state.db.clone()).list(PROJECT_LIST_LIMIT)?))
}

pub async fn get_project(
    State(state): State<AppState>,
    Path(project_id): Path<ProjectId>,
) -> ApiResult<impl IntoResponse> {
    let project = ProjectRepo::new(state.db.clone()).get(&project_id)?;
    let report = ReportRepo::new(state.db.clone()).current_for_project(&project_id)?;
    Ok(Json(json!({
        "project": project,
        "report": report,
        "run_state": state.orchestrator.run_state(&project_id),
    })))
}

pub async fn toggle_favorite(
    State(state): State<AppState>,
    Path(project_id): Path<ProjectId>,
) -> ApiResult<impl IntoResponse> {
    let is_favorite = ProjectRepo::new(state.db.clone()).toggle_favorite(&project_id)?;
    Ok(Json(json!({ "is_favorite": is_favorite })))
}

fn ensure_idle(state: &AppState, project_id: &ProjectId) -> ApiResult<()> {
    match state.orchestrator.run_state(project_id) {
        run if run.is_running => Err(ApiError::Conflict(format!(
            "project {project_id} has an active run ({})",
            run.run_id.map(|id| id.to_string()).unwrap_or_default()
        ))),
        _ => Ok(()),
    }
}

pub async fn publish(
    State(state): State<AppState>,
    Path(project_id): Path<ProjectId>,
) -> ApiResult<impl IntoResponse> {
    ensure_idle(&state, &project_id)?;
    let project = ProjectRepo::new(state.db.clone()).publish(&project_id)?;
    tracing::info!(project_id = %project_id, "project published");
    Ok(Json(project))
}

#[derive(Debug, Deserialize)]
pub struct UpdatePostRequest {
    pub content: String,
}

pub async fn update_post(
    State(state): State<AppState>,
    Path(project_id): Path<ProjectId>,
    payload: Result<Json<UpdatePostRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    if request.content.trim().is_empty() {
        return Err(ApiError::InvalidParams("content must not be empty".into()));
    }
    ensure_idle(&state, &project_id)?;
    let project = ProjectRepo::new(state.db.clone()).update_post(&project_id, &request.content)?;
    Ok(Json(project))
}

pub async fn list_project_runs(
    State(state): State<AppState>,
    Path(project_id): Path<ProjectId>,
) -> ApiResult<impl IntoResponse> {
    ProjectRepo::new(state.db.clone()).get(&project_id)?;
    Ok(Json(RunRepo::new(state.db.clone()).list_for_project(&project_id)?))
}

pub async fn generate(
    State(state): State<AppState>,
    Path(project_id): Path<ProjectId>,
) -> ApiResult<impl IntoResponse> {
    let run_id = state.orchestrator.start_run(&project_id)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "run_id": run_id }))))
}

#[derive(Debug, Deserialize)]
pub struct RegenerateRequest {
    pub feedback: String,
}

pub async fn regenerate(
    State(state): State<AppState>,
    Path(project_id): Path<ProjectId>,
    payload: Result<Json<RegenerateRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let feedback = request.feedback.trim();
    if feedback.is_empty() {
        return Err(ApiError::InvalidParams("feedback must not be empty".into()));
    }
    let run_id = state.orchestrator.resume_with_feedback(&project_id, feedback.to_owned())?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "run_id": run_id }))))
}

pub async fn get_run(State(state): State<AppState>, Path(run_id): Path<RunId>) -> ApiResult<impl IntoResponse> {
    let run = RunRepo::new(state.db.clone()).get(&run_id)?;
    let steps = StepRepo::new(state.db.clone()).list_for_run(&run_id)?;
    let drafts = DraftRepo::new(state.db.clone()).list_for_run(&run_id)?;
    let findings = FindingRepo::new(state.db.clone()).list_for_run(&run_id)?;
    let reports = ReportRepo::new(state.db.clone()).list_for_run(&run_id)?;
    Ok(Json(json!({
        "run": run,
        "steps": steps,
        "drafts": drafts,
        "findings": findings,
        "reports": reports,
    })))
}

pub async fn evaluate(State(state): State<AppState>, Path(run_id): Path<RunId>) -> ApiResult<impl IntoResponse> {
    let run_id = state.orchestrator.reevaluate(&run_id)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "run_id": run_id }))))
}

pub async fn cancel(State(state): State<AppState>, Path(run_id): Path<RunId>) -> Json<Value> {
    Json(json!({ "cancelled": state.orchestrator.cancel_run(&run_id) }))
}

pub async fn logs(
    State(state): State<AppState>,
    query: Result<Query<LogQuery>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(query) = query?;
    let Some(sink) = &state.logs else {
        return Ok(Json(Vec::<LogRecord>::new()));
    };
    let records = sink
        .query(&query)
        .map_err(|e| ApiError::Internal(format!("log query failed: {e}")))?;
    Ok(Json(records))
}

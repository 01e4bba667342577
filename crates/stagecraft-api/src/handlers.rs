//! REST API handlers.
//!
//! Handlers go through the `Sequencer` for anything that changes a run and
//! return JSON in a `{success, data, error}` envelope.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;
use tracing::{debug, info};

use stagecraft_artifact::ResolveArtifact;
use stagecraft_core::SourceRevision;
use stagecraft_health::Prober;
use stagecraft_pipeline::{AbortOutcome, Deployer, SequencerError};

use crate::{ApiState, spawn_drive};

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

/// HTTP status for a sequencer error.
fn status_for(e: &SequencerError) -> StatusCode {
    match e {
        SequencerError::RunNotFound(_)
        | SequencerError::ForeignRun { .. }
        | SequencerError::UnknownStage { .. } => StatusCode::NOT_FOUND,
        SequencerError::NotAwaitingApproval { .. }
        | SequencerError::RunActive { .. }
        | SequencerError::RunFinished { .. }
        | SequencerError::NotRestartable { .. } => StatusCode::CONFLICT,
        SequencerError::ApprovalExpired { .. } => StatusCode::GONE,
        SequencerError::State(_) | SequencerError::Transition(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn sequencer_error(e: SequencerError) -> axum::response::Response {
    error_response(&e.to_string(), status_for(&e)).into_response()
}

// ── Source trigger ─────────────────────────────────────────────

/// POST /api/v1/hooks/source
pub async fn source_hook<A, D, P>(
    State(state): State<ApiState<A, D, P>>,
    Json(revision): Json<SourceRevision>,
) -> impl IntoResponse
where
    A: ResolveArtifact + 'static,
    D: Deployer + 'static,
    P: Prober,
{
    let watched = &state.watched;
    if !revision.matches(&watched.repository, &watched.branch) {
        debug!(%revision, "ignoring push to unwatched branch");
        return ApiResponse::ok(serde_json::json!({
            "started": false,
            "reason": format!("not watching {}#{}", revision.repository, revision.branch),
        }))
        .into_response();
    }

    match state.sequencer.start(revision) {
        Ok(run_id) => {
            spawn_drive(state.sequencer.clone(), run_id.clone());
            (
                StatusCode::ACCEPTED,
                ApiResponse::ok(serde_json::json!({ "started": true, "run_id": run_id })),
            )
                .into_response()
        }
        Err(e) => sequencer_error(e),
    }
}

// ── Runs ───────────────────────────────────────────────────────

/// GET /api/v1/runs
pub async fn list_runs<A, D, P>(State(state): State<ApiState<A, D, P>>) -> impl IntoResponse
where
    A: ResolveArtifact + 'static,
    D: Deployer + 'static,
    P: Prober,
{
    let pipeline = state.sequencer.pipeline().name().to_string();
    match state.sequencer.store().list_runs() {
        Ok(runs) => {
            let mut runs: Vec<_> = runs.into_iter().filter(|r| r.pipeline.name() == pipeline).collect();
            runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            ApiResponse::ok(runs).into_response()
        }
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// GET /api/v1/runs/{id}
pub async fn get_run<A, D, P>(
    State(state): State<ApiState<A, D, P>>,
    Path(id): Path<String>,
) -> impl IntoResponse
where
    A: ResolveArtifact + 'static,
    D: Deployer + 'static,
    P: Prober,
{
    match state.sequencer.status(&id) {
        Ok(run) => ApiResponse::ok(run).into_response(),
        Err(e) => sequencer_error(e),
    }
}

// ── Operator controls ──────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ApproveRequest {
    #[serde(default)]
    pub approved_by: Option<String>,
}

/// POST /api/v1/runs/{id}/stages/{stage}/approve
pub async fn approve_stage<A, D, P>(
    State(state): State<ApiState<A, D, P>>,
    Path((id, stage)): Path<(String, String)>,
    Json(req): Json<ApproveRequest>,
) -> impl IntoResponse
where
    A: ResolveArtifact + 'static,
    D: Deployer + 'static,
    P: Prober,
{
    if let Err(e) = state.sequencer.approve(&id, &stage, req.approved_by.clone()).await {
        return sequencer_error(e);
    }
    spawn_drive(state.sequencer.clone(), id.clone());
    (
        StatusCode::ACCEPTED,
        ApiResponse::ok(serde_json::json!({
            "run_id": id,
            "stage": stage,
            "approved_by": req.approved_by,
        })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct AbortBody {
    #[serde(default = "default_abort_reason")]
    pub reason: String,
}

fn default_abort_reason() -> String {
    "aborted by operator".to_string()
}

/// POST /api/v1/runs/{id}/abort
pub async fn abort_run<A, D, P>(
    State(state): State<ApiState<A, D, P>>,
    Path(id): Path<String>,
    Json(body): Json<AbortBody>,
) -> impl IntoResponse
where
    A: ResolveArtifact + 'static,
    D: Deployer + 'static,
    P: Prober,
{
    match state.sequencer.abort(&id, &body.reason).await {
        Ok(outcome) => {
            let outcome = match outcome {
                AbortOutcome::Aborted => "aborted",
                AbortOutcome::Requested => "requested",
            };
            info!(run_id = %id, outcome, "abort handled");
            ApiResponse::ok(serde_json::json!({ "run_id": id, "outcome": outcome })).into_response()
        }
        Err(e) => sequencer_error(e),
    }
}

/// POST /api/v1/runs/{id}/restart
pub async fn restart_run<A, D, P>(
    State(state): State<ApiState<A, D, P>>,
    Path(id): Path<String>,
) -> impl IntoResponse
where
    A: ResolveArtifact + 'static,
    D: Deployer + 'static,
    P: Prober,
{
    if let Err(e) = state.sequencer.reopen(&id).await {
        return sequencer_error(e);
    }
    spawn_drive(state.sequencer.clone(), id.clone());
    (
        StatusCode::ACCEPTED,
        ApiResponse::ok(serde_json::json!({ "run_id": id, "restarted": true })),
    )
        .into_response()
}

//! stagecraft-api — REST API for Stagecraft.
//!
//! Receives source-control pushes and exposes the operator controls of a
//! pipeline's runs. Every long-running step (building, deploying, waiting
//! on health) happens on a background task; handlers only validate,
//! persist and return.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/hooks/source` | Source push; starts a run for the watched branch |
//! | GET | `/api/v1/runs` | List runs of the pipeline |
//! | GET | `/api/v1/runs/{id}` | Run record with per-stage attempts |
//! | POST | `/api/v1/runs/{id}/stages/{stage}/approve` | Approve a suspended stage |
//! | POST | `/api/v1/runs/{id}/abort` | Abort a run |
//! | POST | `/api/v1/runs/{id}/restart` | Restart an aborted run from its failing stage |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tokio::task::JoinHandle;
use tracing::{error, info};

use stagecraft_artifact::ResolveArtifact;
use stagecraft_health::Prober;
use stagecraft_pipeline::{Deployer, Sequencer};

/// The repository and branch whose pushes start runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedSource {
    pub repository: String,
    pub branch: String,
}

/// Shared state for API handlers.
pub struct ApiState<A, D, P> {
    pub sequencer: Arc<Sequencer<A, D, P>>,
    pub watched: WatchedSource,
}

impl<A, D, P> Clone for ApiState<A, D, P> {
    fn clone(&self) -> Self {
        Self {
            sequencer: self.sequencer.clone(),
            watched: self.watched.clone(),
        }
    }
}

/// Build the API router for one pipeline.
pub fn build_router<A, D, P>(sequencer: Arc<Sequencer<A, D, P>>, watched: WatchedSource) -> Router
where
    A: ResolveArtifact + 'static,
    D: Deployer + 'static,
    P: Prober,
{
    let state = ApiState { sequencer, watched };

    let api_routes = Router::new()
        .route("/hooks/source", post(handlers::source_hook::<A, D, P>))
        .route("/runs", get(handlers::list_runs::<A, D, P>))
        .route("/runs/{id}", get(handlers::get_run::<A, D, P>))
        .route(
            "/runs/{id}/stages/{stage}/approve",
            post(handlers::approve_stage::<A, D, P>),
        )
        .route("/runs/{id}/abort", post(handlers::abort_run::<A, D, P>))
        .route("/runs/{id}/restart", post(handlers::restart_run::<A, D, P>))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}

/// Drive a run on a background task, logging where it ends up.
pub fn spawn_drive<A, D, P>(sequencer: Arc<Sequencer<A, D, P>>, run_id: String) -> JoinHandle<()>
where
    A: ResolveArtifact + 'static,
    D: Deployer + 'static,
    P: Prober,
{
    tokio::spawn(async move {
        match sequencer.drive(&run_id).await {
            Ok(outcome) => info!(%run_id, ?outcome, "run advanced"),
            Err(e) => error!(%run_id, error = %e, "run could not advance"),
        }
    })
}

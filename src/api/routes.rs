//! Control API route handlers.
//!
//! All endpoints return JSON. State is shared via `Arc<ApiState>`.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::DetectionSettings;
use crate::engine::{CancelFlag, DetectionService};
use crate::types::{DetectionError, DetectionReport, SeedRequest};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Shared state accessible by all route handlers.
pub struct ApiState {
    pub service: DetectionService,
    pub runs: RwLock<HashMap<Uuid, RunEntry>>,
    /// Finished or failed runs kept before the oldest are evicted.
    pub max_finished_runs: usize,
}

impl ApiState {
    pub fn new(service: DetectionService, max_finished_runs: usize) -> Self {
        Self {
            service,
            runs: RwLock::new(HashMap::new()),
            max_finished_runs,
        }
    }
}

/// Drop the oldest finished runs until at most `keep` remain. Running
/// entries are never evicted.
fn evict_finished(runs: &mut HashMap<Uuid, RunEntry>, keep: usize) -> usize {
    let mut finished: Vec<(DateTime<Utc>, Uuid)> = runs
        .iter()
        .filter_map(|(id, e)| e.finished_at.map(|at| (at, *id)))
        .collect();
    if finished.len() <= keep {
        return 0;
    }
    finished.sort();
    let excess = finished.len() - keep;
    for (_, id) in &finished[..excess] {
        runs.remove(id);
    }
    excess
}

pub type AppState = Arc<ApiState>;

/// Book-keeping for one launched run.
pub struct RunEntry {
    pub cancel: CancelFlag,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Finished { report: DetectionReport },
    Failed { error: String },
}

impl RunStatus {
    fn label(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Finished { .. } => "finished",
            RunStatus::Failed { .. } => "failed",
        }
    }
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct StartRunRequest {
    #[serde(flatten)]
    pub seed: SeedRequest,
    /// Per-run replacement for the service's detection settings.
    #[serde(default)]
    pub settings: Option<DetectionSettings>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub cancel_requested: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunView {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub cancel_requested: bool,
    #[serde(flatten)]
    pub status: RunStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Error half of every handler result.
pub struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorBody { error: self.1 })).into_response()
    }
}

impl From<DetectionError> for ApiError {
    fn from(e: DetectionError) -> Self {
        let status = match e {
            DetectionError::InvalidSeed(_) | DetectionError::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, e.to_string())
    }
}

fn not_found(id: Uuid) -> ApiError {
    ApiError(StatusCode::NOT_FOUND, format!("unknown run {id}"))
}

fn summary(id: Uuid, entry: &RunEntry) -> RunSummary {
    RunSummary {
        run_id: id,
        status: entry.status.label().to_string(),
        started_at: entry.started_at,
        cancel_requested: entry.cancel.is_cancelled(),
    }
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// POST /api/runs
pub async fn start_run(
    State(state): State<AppState>,
    Json(req): Json<StartRunRequest>,
) -> Result<(StatusCode, Json<RunSummary>), ApiError> {
    let handle = state.service.start(req.seed, req.settings)?;
    let id = handle.id();

    let entry = RunEntry {
        cancel: handle.cancel_flag(),
        started_at: Utc::now(),
        finished_at: None,
        status: RunStatus::Running,
    };
    let body = summary(id, &entry);
    state.runs.write().await.insert(id, entry);

    // record the outcome once the run task ends
    let watcher = state.clone();
    tokio::spawn(async move {
        let status = match handle.wait().await {
            Ok(report) => RunStatus::Finished { report },
            Err(e) => {
                warn!(run_id = %id, error = %e, "Run failed");
                RunStatus::Failed { error: e.to_string() }
            }
        };
        let mut runs = watcher.runs.write().await;
        if let Some(entry) = runs.get_mut(&id) {
            entry.status = status;
            entry.finished_at = Some(Utc::now());
        }
        let evicted = evict_finished(&mut runs, watcher.max_finished_runs);
        if evicted > 0 {
            info!(evicted, "Evicted finished runs");
        }
    });

    info!(run_id = %id, "Run accepted");
    Ok((StatusCode::ACCEPTED, Json(body)))
}

/// GET /api/runs
pub async fn list_runs(State(state): State<AppState>) -> Json<Vec<RunSummary>> {
    let runs = state.runs.read().await;
    let mut list: Vec<RunSummary> = runs.iter().map(|(id, e)| summary(*id, e)).collect();
    list.sort_by_key(|s| s.started_at);
    Json(list)
}

/// GET /api/runs/:id
pub async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<RunView>, ApiError> {
    let runs = state.runs.read().await;
    let entry = runs.get(&id).ok_or_else(|| not_found(id))?;
    Ok(Json(RunView {
        run_id: id,
        started_at: entry.started_at,
        cancel_requested: entry.cancel.is_cancelled(),
        status: entry.status.clone(),
    }))
}

/// POST /api/runs/:id/cancel
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<RunSummary>), ApiError> {
    let runs = state.runs.read().await;
    let entry = runs.get(&id).ok_or_else(|| not_found(id))?;
    entry.cancel.cancel();
    info!(run_id = %id, "Cancellation requested via API");
    Ok((StatusCode::ACCEPTED, Json(summary(id, entry))))
}

/// DELETE /api/runs/:id
///
/// Forget a finished run and its report. A running run must be cancelled
/// and finish first.
pub async fn delete_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let mut runs = state.runs.write().await;
    let entry = runs.get(&id).ok_or_else(|| not_found(id))?;
    if entry.finished_at.is_none() {
        return Err(ApiError(StatusCode::CONFLICT, format!("run {id} is still running")));
    }
    runs.remove(&id);
    info!(run_id = %id, "Run deleted via API");
    Ok(StatusCode::NO_CONTENT)
}

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

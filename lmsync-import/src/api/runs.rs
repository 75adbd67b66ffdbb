//! Import run endpoints
//!
//! POST /runs, POST /runs/cancel, GET /runs/latest, GET /runs/:run_id

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use lmsync_common::events::RunState;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::models::RunReport;
use crate::AppState;

/// POST /runs/cancel response
#[derive(Debug, Serialize)]
pub struct CancelRunResponse {
    pub cancelled: bool,
}

/// Clears the in-process active-run slot when the run task ends, including
/// by panic
struct ActiveRunGuard {
    slot: Arc<RwLock<Option<CancellationToken>>>,
    armed: bool,
}

impl ActiveRunGuard {
    async fn release(mut self) {
        *self.slot.write().await = None;
        self.armed = false;
    }
}

impl Drop for ActiveRunGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match self.slot.try_write() {
            Ok(mut active) => *active = None,
            Err(_) => tracing::error!("Active run slot busy while unwinding; restart may be required"),
        }
    }
}

/// POST /runs
///
/// Executes one run and returns its report once it reaches a terminal
/// state. Returns 409 when a run is already in progress.
///
/// The run executes in its own task and outlives the request, so a client
/// that disconnects early does not leave the run lock held.
pub async fn start_run(State(state): State<AppState>) -> ApiResult<Json<RunReport>> {
    let cancel = CancellationToken::new();
    {
        let mut active = state.active_run.write().await;
        if active.is_some() {
            return Err(ApiError::Conflict("Import run already in progress".to_string()));
        }
        *active = Some(cancel.clone());
    }

    let guard = ActiveRunGuard {
        slot: Arc::clone(&state.active_run),
        armed: true,
    };
    let task_state = state.clone();
    let run = tokio::spawn(async move {
        let result = task_state.controller.run_with_cancel(cancel).await;

        if let Ok(report) = &result {
            if report.state == RunState::Failed {
                *task_state.last_error.write().await = report.fatal_error.clone();
            }
        }
        guard.release().await;

        result
    });

    let report = run
        .await
        .map_err(|e| ApiError::Internal(format!("Import run task failed: {}", e)))??;

    Ok(Json(report))
}

/// POST /runs/cancel
///
/// Requests cancellation of the run executing in this process. The run
/// stops before its next item and ends CANCELLED.
pub async fn cancel_run(State(state): State<AppState>) -> Json<CancelRunResponse> {
    let cancelled = match state.active_run.read().await.as_ref() {
        Some(token) => {
            token.cancel();
            tracing::info!("Cancellation requested for active import run");
            true
        }
        None => false,
    };

    Json(CancelRunResponse { cancelled })
}

/// GET /runs/latest
pub async fn latest_run(State(state): State<AppState>) -> ApiResult<Json<RunReport>> {
    crate::db::runs::load_latest_run(&state.db)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("No import run recorded yet".to_string()))
}

/// GET /runs/:run_id
pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Json<RunReport>> {
    crate::db::runs::load_run(&state.db, run_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Import run not found: {}", run_id)))
}

/// Build run routes
pub fn run_routes() -> Router<AppState> {
    Router::new()
        .route("/runs", post(start_run))
        .route("/runs/cancel", post(cancel_run))
        .route("/runs/latest", get(latest_run))
        .route("/runs/:run_id", get(get_run))
}

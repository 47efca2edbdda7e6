use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::AppError;
use crate::state::AppState;
use crate::sync::orchestrator::SyncReport;

#[derive(Deserialize)]
pub struct SyncRequest {
    pub user_id: Uuid,
}

#[derive(Serialize)]
pub struct SyncResponse {
    pub user_id: Uuid,
    #[serde(flatten)]
    pub report: SyncReport,
}

/// POST /api/v1/context/sync
/// Runs a sync for one user right away, bypassing the queue.
pub async fn handle_sync_user(
    State(state): State<AppState>,
    Json(req): Json<SyncRequest>,
) -> Result<Json<SyncResponse>, AppError> {
    let report = state.orchestrator.run(req.user_id).await?;

    if let SyncReport::AllSourcesFailed { failures } = &report {
        let detail = failures
            .iter()
            .map(|f| format!("{}: {}", f.source_id, f.error))
            .collect::<Vec<_>>()
            .join("; ");
        return Err(AppError::SyncFailed(format!(
            "all {} sources failed ({detail})",
            failures.len()
        )));
    }

    Ok(Json(SyncResponse {
        user_id: req.user_id,
        report,
    }))
}

#[derive(Deserialize, Default)]
pub struct SweepRequest {
    pub limit: Option<usize>,
}

#[derive(Serialize)]
pub struct SweepResponse {
    pub enqueued: usize,
}

/// POST /api/v1/context/sync/due
/// Runs one due-pair sweep. The body is optional.
pub async fn handle_sync_due(
    State(state): State<AppState>,
    body: Option<Json<SweepRequest>>,
) -> Result<Json<SweepResponse>, AppError> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let limit = req.limit.unwrap_or(state.config.sync.sweep_limit);
    if limit == 0 {
        return Err(AppError::Validation("limit must be positive".into()));
    }
    let enqueued = state.scheduler.sweep(limit).await?;
    Ok(Json(SweepResponse { enqueued }))
}

use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::context::ContextSnapshot;
use crate::state::AppState;

const HISTORY_DEFAULT_LIMIT: i64 = 20;
const HISTORY_MAX_LIMIT: i64 = 100;

#[derive(Deserialize)]
pub struct UserIdQuery {
    pub user_id: Uuid,
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub user_id: Uuid,
    pub limit: Option<i64>,
}

/// GET /api/v1/context/snapshot
/// Latest merged context for prompt assembly.
pub async fn handle_latest_snapshot(
    State(state): State<AppState>,
    Query(params): Query<UserIdQuery>,
) -> Result<Json<ContextSnapshot>, AppError> {
    let snapshot = state
        .snapshots
        .latest(params.user_id)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(format!("No context snapshot for user {}", params.user_id))
        })?;
    Ok(Json(snapshot))
}

/// GET /api/v1/context/snapshots
pub async fn handle_snapshot_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryQuery>,
) -> Result<Json<Vec<ContextSnapshot>>, AppError> {
    let limit = params.limit.unwrap_or(HISTORY_DEFAULT_LIMIT);
    if !(1..=HISTORY_MAX_LIMIT).contains(&limit) {
        return Err(AppError::Validation(format!(
            "limit must be between 1 and {HISTORY_MAX_LIMIT}"
        )));
    }
    let history = state.snapshots.history(params.user_id, limit).await?;
    Ok(Json(history))
}

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::source::{ContextSource, ContextSourceUpdate, NewContextSource};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub skip: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    100
}

fn not_found(id: Uuid) -> AppError {
    AppError::NotFound(format!("Context source {id} not found"))
}

/// GET /api/v1/context-sources
pub async fn handle_list_sources(
    State(state): State<AppState>,
    Query(params): Query<ListQuery>,
) -> Result<Json<Vec<ContextSource>>, AppError> {
    if params.skip < 0 || !(1..=500).contains(&params.limit) {
        return Err(AppError::Validation(
            "skip must be >= 0 and limit between 1 and 500".into(),
        ));
    }
    let sources = state.sources.list(params.skip, params.limit).await?;
    Ok(Json(sources))
}

/// POST /api/v1/context-sources
pub async fn handle_create_source(
    State(state): State<AppState>,
    Json(req): Json<NewContextSource>,
) -> Result<(StatusCode, Json<ContextSource>), AppError> {
    req.validate()
        .map_err(|e| AppError::Validation(e.to_string()))?;
    let source = state.sources.create(&req).await?;
    Ok((StatusCode::CREATED, Json(source)))
}

/// GET /api/v1/context-sources/:id
pub async fn handle_get_source(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ContextSource>, AppError> {
    let source = state.sources.get(id).await?.ok_or_else(|| not_found(id))?;
    Ok(Json(source))
}

/// PATCH /api/v1/context-sources/:id
pub async fn handle_update_source(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ContextSourceUpdate>,
) -> Result<Json<ContextSource>, AppError> {
    req.validate()
        .map_err(|e| AppError::Validation(e.to_string()))?;
    let source = state
        .sources
        .update(id, &req)
        .await?
        .ok_or_else(|| not_found(id))?;
    Ok(Json(source))
}

/// DELETE /api/v1/context-sources/:id
/// Soft delete; state rows are kept.
pub async fn handle_delete_source(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    if !state.sources.soft_delete(id).await? {
        return Err(not_found(id));
    }
    Ok(StatusCode::NO_CONTENT)
}

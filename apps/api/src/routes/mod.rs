pub mod health;

use axum::{
    routing::{get, post},
    Router,
};

use crate::context::handlers as context;
use crate::sources::handlers as sources;
use crate::state::AppState;
use crate::sync::handlers as sync;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Source registry
        .route(
            "/api/v1/context-sources",
            get(sources::handle_list_sources).post(sources::handle_create_source),
        )
        .route(
            "/api/v1/context-sources/:id",
            get(sources::handle_get_source)
                .patch(sources::handle_update_source)
                .delete(sources::handle_delete_source),
        )
        // Snapshots
        .route(
            "/api/v1/context/snapshot",
            get(context::handle_latest_snapshot),
        )
        .route(
            "/api/v1/context/snapshots",
            get(context::handle_snapshot_history),
        )
        // Sync triggers
        .route("/api/v1/context/sync", post(sync::handle_sync_user))
        .route("/api/v1/context/sync/due", post(sync::handle_sync_due))
        .with_state(state)
}

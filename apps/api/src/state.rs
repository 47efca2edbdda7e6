use std::sync::Arc;

use crate::config::Config;
use crate::context::snapshots::SnapshotStore;
use crate::sources::registry::SourceRegistry;
use crate::sync::orchestrator::SyncOrchestrator;
use crate::sync::scheduler::SyncScheduler;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub sources: Arc<dyn SourceRegistry>,
    /// Read side of the snapshot store, also the prompt-assembly contract.
    pub snapshots: Arc<dyn SnapshotStore>,
    pub orchestrator: Arc<SyncOrchestrator>,
    pub scheduler: Arc<SyncScheduler>,
}

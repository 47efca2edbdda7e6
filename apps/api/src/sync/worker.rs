//! Background loops: the periodic due-pair sweep and the queue workers.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::sync::orchestrator::SyncOrchestrator;
use crate::sync::queue::SyncQueue;
use crate::sync::scheduler::SyncScheduler;

/// How long one `dequeue` call waits before looping.
const DEQUEUE_WAIT: Duration = Duration::from_secs(5);
/// Pause after a queue error so a Redis outage doesn't spin.
const QUEUE_ERROR_PAUSE: Duration = Duration::from_secs(5);

pub async fn run_sweep_loop(scheduler: Arc<SyncScheduler>, interval: Duration, limit: usize) {
    info!("Context sync sweep every {}s (limit {limit})", interval.as_secs());
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(e) = scheduler.sweep(limit).await {
            error!("Context sync sweep failed: {e}");
        }
    }
}

pub async fn run_worker(
    worker_id: usize,
    queue: Arc<dyn SyncQueue>,
    orchestrator: Arc<SyncOrchestrator>,
) {
    info!("Context sync worker {worker_id} started");
    loop {
        match queue.dequeue(DEQUEUE_WAIT).await {
            Ok(Some(user_id)) => {
                process_user(queue.as_ref(), &orchestrator, user_id).await;
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Context sync worker {worker_id} could not read queue: {e}");
                tokio::time::sleep(QUEUE_ERROR_PAUSE).await;
            }
        }
    }
}

/// Runs one user's sync and releases their queue slot whatever happens.
/// Returns the user id unless every source failed or the run aborted.
pub async fn process_user(
    queue: &dyn SyncQueue,
    orchestrator: &SyncOrchestrator,
    user_id: Uuid,
) -> Option<Uuid> {
    let synced = match orchestrator.run(user_id).await {
        Ok(report) => {
            let synced = report.user_id_if_ok(user_id);
            if synced.is_none() {
                warn!("Context sync for user {user_id}: every source failed");
            }
            synced
        }
        Err(e) => {
            error!("Context sync for user {user_id} aborted: {e}");
            None
        }
    };
    if let Err(e) = queue.complete(user_id).await {
        warn!("Could not release queue slot for user {user_id}: {e}");
    }
    synced
}

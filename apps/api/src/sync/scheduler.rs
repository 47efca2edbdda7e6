//! Due-pair scheduler: decides which (source, user) pairs need a sync and
//! enqueues one run per user.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::StoreError;
use crate::models::source::ContextSource;
use crate::sources::registry::SourceRegistry;
use crate::sources::state_store::SyncStateStore;
use crate::sync::metrics::USERS_ENQUEUED;
use crate::sync::queue::SyncQueue;
use crate::users::UserDirectory;

/// Candidate page sizes for the cross-product scan.
pub const SCAN_SOURCE_LIMIT: i64 = 200;
pub const SCAN_USER_LIMIT: i64 = 1_000;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DuePair {
    pub source_id: Uuid,
    pub user_id: Uuid,
}

/// Enumerates due pairs. A pair is due when it has no state row yet, its
/// row was never scheduled, or its `next_run_at` has passed.
#[async_trait]
pub trait DuePairScan: Send + Sync {
    async fn due_pairs(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<DuePair>, StoreError>;
}

/// Enabled sources × active users, filtered in process against the state
/// rows of the candidate sources. Both lists are capped, so sources or
/// users past the caps are never scheduled.
pub struct CrossProductScan {
    sources: Arc<dyn SourceRegistry>,
    users: Arc<dyn UserDirectory>,
    states: Arc<dyn SyncStateStore>,
}

impl CrossProductScan {
    pub fn new(
        sources: Arc<dyn SourceRegistry>,
        users: Arc<dyn UserDirectory>,
        states: Arc<dyn SyncStateStore>,
    ) -> Self {
        Self {
            sources,
            users,
            states,
        }
    }
}

#[async_trait]
impl DuePairScan for CrossProductScan {
    async fn due_pairs(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<DuePair>, StoreError> {
        let sources: Vec<ContextSource> = self
            .sources
            .list_enabled(SCAN_SOURCE_LIMIT)
            .await?
            .into_iter()
            .filter(ContextSource::is_syncable)
            .collect();
        if sources.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let users = self.users.list_active(SCAN_USER_LIMIT).await?;

        let source_ids: Vec<Uuid> = sources.iter().map(|s| s.id).collect();
        let states: HashMap<(Uuid, Uuid), bool> = self
            .states
            .list_for_sources(&source_ids)
            .await?
            .into_iter()
            .map(|s| ((s.source_id, s.user_id), s.is_due(now)))
            .collect();

        let mut due = Vec::new();
        let mut seen = HashSet::new();
        for source in &sources {
            for user in &users {
                let pair = DuePair {
                    source_id: source.id,
                    user_id: user.id,
                };
                if seen.contains(&pair) {
                    continue;
                }
                if states.get(&(source.id, user.id)).copied().unwrap_or(true) {
                    seen.insert(pair.clone());
                    due.push(pair);
                    if due.len() >= limit {
                        return Ok(due);
                    }
                }
            }
        }
        Ok(due)
    }
}

pub struct SyncScheduler {
    scan: Arc<dyn DuePairScan>,
    queue: Arc<dyn SyncQueue>,
}

impl SyncScheduler {
    pub fn new(scan: Arc<dyn DuePairScan>, queue: Arc<dyn SyncQueue>) -> Self {
        Self { scan, queue }
    }

    pub async fn sweep(&self, limit: usize) -> Result<usize, StoreError> {
        self.sweep_at(limit, Utc::now()).await
    }

    /// Enqueues one run per distinct user among the due pairs. Returns how
    /// many users were newly enqueued; users already waiting are skipped and
    /// a queue error for one user does not stop the sweep.
    pub async fn sweep_at(&self, limit: usize, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let pairs = self.scan.due_pairs(limit, now).await?;

        let mut users = Vec::new();
        let mut seen = HashSet::new();
        for pair in &pairs {
            if seen.insert(pair.user_id) {
                users.push(pair.user_id);
            }
        }

        let mut enqueued = 0;
        for user_id in users {
            match self.queue.enqueue(user_id).await {
                Ok(true) => enqueued += 1,
                Ok(false) => {}
                Err(e) => warn!("Could not enqueue context sync for user {user_id}: {e}"),
            }
        }

        counter!(USERS_ENQUEUED).increment(enqueued as u64);
        info!(
            "Enqueued context sync for {enqueued} users ({} due pairs)",
            pairs.len()
        );
        Ok(enqueued)
    }
}

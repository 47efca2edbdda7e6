use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Per (source, user) sync bookkeeping. Exactly one row per pair.
///
/// `etag` and `since_cursor` are opaque source-defined tokens: stored and
/// forwarded verbatim, never parsed.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SyncState {
    pub id: Uuid,
    pub source_id: Uuid,
    pub user_id: Uuid,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub etag: Option<String>,
    pub since_cursor: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
}

impl SyncState {
    /// A row that was created but never scheduled counts as due.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_run_at.map_or(true, |next| next <= now)
    }
}

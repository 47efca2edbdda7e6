use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::errors::StoreError;
use crate::models::sync_state::SyncState;

/// What happened on one fetch attempt, as far as bookkeeping cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Fetched {
        etag: Option<String>,
        cursor: Option<String>,
    },
    NotModified,
    Failed {
        error: String,
    },
}

/// One atomic write to a state row after an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStateUpdate {
    pub at: DateTime<Utc>,
    pub next_run_at: DateTime<Utc>,
    pub outcome: SyncOutcome,
}

#[cfg(test)]
impl SyncStateUpdate {
    /// In-memory form of the `UPDATE` statements in [`PgSyncStateStore::apply`].
    ///
    /// A success that does not advertise a new ETag or cursor keeps the
    /// previous one. A 304 leaves `last_error` alone.
    pub fn apply_to(&self, state: &mut SyncState) {
        state.last_attempt_at = Some(self.at);
        state.next_run_at = Some(self.next_run_at);
        match &self.outcome {
            SyncOutcome::Fetched { etag, cursor } => {
                state.last_success_at = Some(self.at);
                state.last_error = None;
                if etag.is_some() {
                    state.etag = etag.clone();
                }
                if cursor.is_some() {
                    state.since_cursor = cursor.clone();
                }
            }
            SyncOutcome::NotModified => {
                state.last_success_at = Some(self.at);
            }
            SyncOutcome::Failed { error } => {
                state.last_error = Some(error.clone());
            }
        }
    }
}

#[async_trait]
pub trait SyncStateStore: Send + Sync {
    /// Returns the row for the pair, inserting an empty one on first sight.
    async fn get_or_create(&self, source_id: Uuid, user_id: Uuid)
        -> Result<SyncState, StoreError>;

    async fn apply(&self, state_id: Uuid, update: &SyncStateUpdate) -> Result<(), StoreError>;

    async fn list_for_sources(&self, source_ids: &[Uuid]) -> Result<Vec<SyncState>, StoreError>;
}

pub struct PgSyncStateStore {
    pool: PgPool,
}

impl PgSyncStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SyncStateStore for PgSyncStateStore {
    async fn get_or_create(
        &self,
        source_id: Uuid,
        user_id: Uuid,
    ) -> Result<SyncState, StoreError> {
        // The no-op DO UPDATE makes RETURNING yield the existing row too.
        Ok(sqlx::query_as::<_, SyncState>(
            r#"
            INSERT INTO context_source_state (id, source_id, user_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (source_id, user_id)
                DO UPDATE SET source_id = EXCLUDED.source_id
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(source_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn apply(&self, state_id: Uuid, update: &SyncStateUpdate) -> Result<(), StoreError> {
        let query = match &update.outcome {
            SyncOutcome::Fetched { etag, cursor } => sqlx::query(
                r#"
                UPDATE context_source_state SET
                    last_success_at = $2,
                    last_attempt_at = $2,
                    last_error      = NULL,
                    next_run_at     = $3,
                    etag            = COALESCE($4, etag),
                    since_cursor    = COALESCE($5, since_cursor)
                WHERE id = $1
                "#,
            )
            .bind(state_id)
            .bind(update.at)
            .bind(update.next_run_at)
            .bind(etag.as_deref())
            .bind(cursor.as_deref()),
            SyncOutcome::NotModified => sqlx::query(
                r#"
                UPDATE context_source_state SET
                    last_success_at = $2,
                    last_attempt_at = $2,
                    next_run_at     = $3
                WHERE id = $1
                "#,
            )
            .bind(state_id)
            .bind(update.at)
            .bind(update.next_run_at),
            SyncOutcome::Failed { error } => sqlx::query(
                r#"
                UPDATE context_source_state SET
                    last_attempt_at = $2,
                    last_error      = $4,
                    next_run_at     = $3
                WHERE id = $1
                "#,
            )
            .bind(state_id)
            .bind(update.at)
            .bind(update.next_run_at)
            .bind(error.as_str()),
        };

        query.execute(&self.pool).await?;
        Ok(())
    }

    async fn list_for_sources(&self, source_ids: &[Uuid]) -> Result<Vec<SyncState>, StoreError> {
        if source_ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(sqlx::query_as::<_, SyncState>(
            "SELECT * FROM context_source_state WHERE source_id = ANY($1)",
        )
        .bind(source_ids)
        .fetch_all(&self.pool)
        .await?)
    }
}

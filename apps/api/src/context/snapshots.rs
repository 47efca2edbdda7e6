use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::context::pack::MergedContextPayload;
use crate::errors::StoreError;
use crate::models::context::ContextSnapshot;

/// Append-only storage of merged payloads. Snapshots are never updated or
/// deleted; "current" is the one with the latest `generated_at`.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn create(
        &self,
        user_id: Uuid,
        payload: &MergedContextPayload,
    ) -> Result<ContextSnapshot, StoreError>;

    async fn latest(&self, user_id: Uuid) -> Result<Option<ContextSnapshot>, StoreError>;

    /// Newest first.
    async fn history(&self, user_id: Uuid, limit: i64) -> Result<Vec<ContextSnapshot>, StoreError>;
}

/// Hex SHA-256 of the serialized payload.
pub fn payload_hash(payload: &MergedContextPayload) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

pub struct PgSnapshotStore {
    pool: PgPool,
}

impl PgSnapshotStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    async fn create(
        &self,
        user_id: Uuid,
        payload: &MergedContextPayload,
    ) -> Result<ContextSnapshot, StoreError> {
        // CRITICAL: append-only. Never UPDATE existing rows.
        let snapshot = sqlx::query_as::<_, ContextSnapshot>(
            r#"
            INSERT INTO context_snapshots
                (id, user_id, schema_version, generated_at, payload, payload_hash)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(&payload.schema_version)
        .bind(payload.generated_at)
        .bind(payload.to_snapshot_value())
        .bind(payload_hash(payload))
        .fetch_one(&self.pool)
        .await?;

        info!(
            "Stored context snapshot {} for user {user_id} (generated_at {})",
            snapshot.id, snapshot.generated_at
        );
        Ok(snapshot)
    }

    async fn latest(&self, user_id: Uuid) -> Result<Option<ContextSnapshot>, StoreError> {
        Ok(sqlx::query_as::<_, ContextSnapshot>(
            r#"
            SELECT * FROM context_snapshots
            WHERE user_id = $1
            ORDER BY generated_at DESC, created_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn history(&self, user_id: Uuid, limit: i64) -> Result<Vec<ContextSnapshot>, StoreError> {
        Ok(sqlx::query_as::<_, ContextSnapshot>(
            r#"
            SELECT * FROM context_snapshots
            WHERE user_id = $1
            ORDER BY generated_at DESC, created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }
}

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::errors::StoreError;
use crate::models::source::{
    ContextSource, ContextSourceRow, ContextSourceUpdate, NewContextSource,
};

/// Registry of external context providers. Every read filters out
/// soft-deleted rows; ordering is always by `source_id`.
#[async_trait]
pub trait SourceRegistry: Send + Sync {
    async fn list(&self, skip: i64, limit: i64) -> Result<Vec<ContextSource>, StoreError>;

    /// Active and enabled sources, the set a sync run fans out to.
    async fn list_enabled(&self, limit: i64) -> Result<Vec<ContextSource>, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<ContextSource>, StoreError>;

    async fn create(&self, new: &NewContextSource) -> Result<ContextSource, StoreError>;

    async fn update(
        &self,
        id: Uuid,
        changes: &ContextSourceUpdate,
    ) -> Result<Option<ContextSource>, StoreError>;

    /// Returns false when the source does not exist or is already deleted.
    async fn soft_delete(&self, id: Uuid) -> Result<bool, StoreError>;
}

pub struct PgSourceRegistry {
    pool: PgPool,
}

impl PgSourceRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn map_unique(err: sqlx::Error, source_id: &str) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::Conflict(format!("source_id '{source_id}' already exists"))
        }
        _ => StoreError::Database(err),
    }
}

#[async_trait]
impl SourceRegistry for PgSourceRegistry {
    async fn list(&self, skip: i64, limit: i64) -> Result<Vec<ContextSource>, StoreError> {
        let rows = sqlx::query_as::<_, ContextSourceRow>(
            r#"
            SELECT * FROM context_sources
            WHERE deleted_at IS NULL
            ORDER BY source_id
            OFFSET $1 LIMIT $2
            "#,
        )
        .bind(skip)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ContextSource::from).collect())
    }

    async fn list_enabled(&self, limit: i64) -> Result<Vec<ContextSource>, StoreError> {
        let rows = sqlx::query_as::<_, ContextSourceRow>(
            r#"
            SELECT * FROM context_sources
            WHERE deleted_at IS NULL AND enabled
            ORDER BY source_id
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ContextSource::from).collect())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ContextSource>, StoreError> {
        let row = sqlx::query_as::<_, ContextSourceRow>(
            "SELECT * FROM context_sources WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ContextSource::from))
    }

    async fn create(&self, new: &NewContextSource) -> Result<ContextSource, StoreError> {
        let capabilities = serde_json::to_value(new.capabilities.unwrap_or_default())
            .unwrap_or(serde_json::Value::Null);

        let row = sqlx::query_as::<_, ContextSourceRow>(
            r#"
            INSERT INTO context_sources
                (id, source_id, display_name, base_url, credential_id,
                 capabilities, poll_interval_seconds, enabled)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new.source_id)
        .bind(new.display_name.trim())
        .bind(&new.base_url)
        .bind(new.credential_id)
        .bind(capabilities)
        .bind(new.poll_interval_seconds as i32)
        .bind(new.enabled)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_unique(e, &new.source_id))?;

        info!("Registered context source '{}' ({})", row.source_id, row.id);
        Ok(row.into())
    }

    async fn update(
        &self,
        id: Uuid,
        changes: &ContextSourceUpdate,
    ) -> Result<Option<ContextSource>, StoreError> {
        let capabilities = changes
            .capabilities
            .and_then(|c| serde_json::to_value(c).ok());
        let (set_credential, credential_id) = match changes.credential_id {
            Some(value) => (true, value),
            None => (false, None),
        };

        let row = sqlx::query_as::<_, ContextSourceRow>(
            r#"
            UPDATE context_sources SET
                source_id             = COALESCE($2, source_id),
                display_name          = COALESCE($3, display_name),
                base_url              = COALESCE($4, base_url),
                credential_id         = CASE WHEN $5 THEN $6 ELSE credential_id END,
                capabilities          = COALESCE($7, capabilities),
                poll_interval_seconds = COALESCE($8, poll_interval_seconds),
                enabled               = COALESCE($9, enabled),
                updated_at            = now()
            WHERE id = $1 AND deleted_at IS NULL
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(changes.source_id.as_deref())
        .bind(changes.display_name.as_deref().map(str::trim))
        .bind(changes.base_url.as_deref())
        .bind(set_credential)
        .bind(credential_id)
        .bind(capabilities)
        .bind(changes.poll_interval_seconds.map(|s| s as i32))
        .bind(changes.enabled)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_unique(e, changes.source_id.as_deref().unwrap_or_default()))?;

        Ok(row.map(ContextSource::from))
    }

    async fn soft_delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE context_sources
            SET deleted_at = now(), updated_at = now()
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        let deleted = result.rows_affected() > 0;
        if deleted {
            info!("Soft-deleted context source {id}");
        }
        Ok(deleted)
    }
}

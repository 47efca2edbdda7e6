use async_trait::async_trait;
use sqlx::PgPool;

use crate::errors::StoreError;
use crate::models::user::User;

/// Read-only view of the users the scheduler fans out to.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Non-deleted users, oldest first.
    async fn list_active(&self, limit: i64) -> Result<Vec<User>, StoreError>;
}

pub struct PgUserDirectory {
    pool: PgPool,
}

impl PgUserDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn list_active(&self, limit: i64) -> Result<Vec<User>, StoreError> {
        Ok(sqlx::query_as::<_, User>(
            r#"
            SELECT id, external_id, created_at FROM users
            WHERE deleted_at IS NULL
            ORDER BY created_at, id
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }
}

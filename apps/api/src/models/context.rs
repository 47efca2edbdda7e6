use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

/// One immutable merged payload for a user. Rows are append-only.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ContextSnapshot {
    pub id: Uuid,
    pub user_id: Uuid,
    pub schema_version: String,
    pub generated_at: DateTime<Utc>,
    pub payload: Value,
    pub payload_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use tracing::warn;
use uuid::Uuid;

use crate::credentials::{AuthError, CredentialKind};

/// Read side of the credential vault. Returns `Ok(None)` for unknown or
/// deleted credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self, credential_id: Uuid) -> Result<Option<CredentialKind>, AuthError>;
}

#[derive(Debug, FromRow)]
struct DecryptedCredentialRow {
    #[sqlx(rename = "type")]
    kind: String,
    fields: String,
}

/// Credentials sealed with pgcrypto. Decryption happens inside Postgres so
/// plaintext never touches a table.
pub struct PgCredentialStore {
    pool: PgPool,
    master_key: Option<String>,
}

impl PgCredentialStore {
    pub fn new(pool: PgPool, master_key: Option<String>) -> Self {
        Self { pool, master_key }
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn load(&self, credential_id: Uuid) -> Result<Option<CredentialKind>, AuthError> {
        let master_key = self.master_key.as_deref().ok_or(AuthError::MissingMasterKey)?;

        let row = sqlx::query_as::<_, DecryptedCredentialRow>(
            r#"
            SELECT type, pgp_sym_decrypt(encrypted_data, $2) AS fields
            FROM credentials
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(credential_id)
        .bind(master_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            warn!("Failed to read credential {credential_id}: {e}");
            AuthError::Store(e.to_string())
        })?;

        let Some(row) = row else {
            return Ok(None);
        };

        let fields: Value = serde_json::from_str(&row.fields)
            .map_err(|e| AuthError::Store(format!("credential {credential_id} is not JSON: {e}")))?;
        CredentialKind::from_parts(&row.kind, &fields).map(Some)
    }
}

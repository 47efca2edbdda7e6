use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use thiserror::Error;
use uuid::Uuid;

pub const SOURCE_ID_MAX_LEN: usize = 64;
pub const DISPLAY_NAME_MAX_LEN: usize = 256;
pub const BASE_URL_MAX_LEN: usize = 512;
pub const POLL_INTERVAL_MIN_SECS: u32 = 60;
pub const POLL_INTERVAL_MAX_SECS: u32 = 86_400;
pub const POLL_INTERVAL_DEFAULT_SECS: u32 = 3_600;

/// Advisory capability flags declared by a source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCapabilities {
    #[serde(default)]
    pub supports_etag: bool,
    #[serde(default)]
    pub supports_since_cursor: bool,
}

/// Lifecycle of a registry entry. Deleted sources keep their row (and their
/// state rows) but never show up in active queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SourceStatus {
    Active,
    Deleted { at: DateTime<Utc> },
}

/// Raw `context_sources` row.
#[derive(Debug, Clone, FromRow)]
pub struct ContextSourceRow {
    pub id: Uuid,
    pub source_id: String,
    pub display_name: String,
    pub base_url: String,
    pub credential_id: Option<Uuid>,
    pub capabilities: Option<Value>,
    pub poll_interval_seconds: i32,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A registered external context provider.
#[derive(Debug, Clone, Serialize)]
pub struct ContextSource {
    pub id: Uuid,
    /// Stable slug, e.g. `linden-api`. Registry order (and so fact
    /// precedence during merge) is alphabetical on this field.
    pub source_id: String,
    pub display_name: String,
    pub base_url: String,
    pub credential_id: Option<Uuid>,
    pub capabilities: SourceCapabilities,
    pub poll_interval_seconds: u32,
    pub enabled: bool,
    pub status: SourceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ContextSourceRow> for ContextSource {
    fn from(row: ContextSourceRow) -> Self {
        let capabilities = row
            .capabilities
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        let status = match row.deleted_at {
            Some(at) => SourceStatus::Deleted { at },
            None => SourceStatus::Active,
        };
        Self {
            id: row.id,
            source_id: row.source_id,
            display_name: row.display_name,
            base_url: row.base_url,
            credential_id: row.credential_id,
            capabilities,
            poll_interval_seconds: u32::try_from(row.poll_interval_seconds)
                .unwrap_or(POLL_INTERVAL_DEFAULT_SECS),
            enabled: row.enabled,
            status,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

impl ContextSource {
    pub fn poll_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::from(self.poll_interval_seconds))
    }

    pub fn is_syncable(&self) -> bool {
        self.enabled && self.status == SourceStatus::Active
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SourceValidationError {
    #[error("source_id must be 1-64 lowercase alphanumerics or hyphens, starting and ending alphanumeric")]
    SourceId,

    #[error("display_name must be 1-256 characters")]
    DisplayName,

    #[error("base_url must be an http:// or https:// URL of at most 512 characters")]
    BaseUrl,

    #[error("poll_interval_seconds must be between 60 and 86400, got {0}")]
    PollInterval(u32),
}

/// Request body for registering a source.
#[derive(Debug, Clone, Deserialize)]
pub struct NewContextSource {
    pub source_id: String,
    pub display_name: String,
    pub base_url: String,
    #[serde(default)]
    pub credential_id: Option<Uuid>,
    #[serde(default)]
    pub capabilities: Option<SourceCapabilities>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl NewContextSource {
    pub fn validate(&self) -> Result<(), SourceValidationError> {
        validate_source_id(&self.source_id)?;
        validate_display_name(&self.display_name)?;
        validate_base_url(&self.base_url)?;
        validate_poll_interval(self.poll_interval_seconds)
    }
}

/// Partial update. `credential_id: null` clears the credential; omitting
/// the field leaves it untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContextSourceUpdate {
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default, deserialize_with = "explicit_null")]
    pub credential_id: Option<Option<Uuid>>,
    #[serde(default)]
    pub capabilities: Option<SourceCapabilities>,
    #[serde(default)]
    pub poll_interval_seconds: Option<u32>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

impl ContextSourceUpdate {
    pub fn validate(&self) -> Result<(), SourceValidationError> {
        if let Some(source_id) = &self.source_id {
            validate_source_id(source_id)?;
        }
        if let Some(name) = &self.display_name {
            validate_display_name(name)?;
        }
        if let Some(url) = &self.base_url {
            validate_base_url(url)?;
        }
        if let Some(secs) = self.poll_interval_seconds {
            validate_poll_interval(secs)?;
        }
        Ok(())
    }
}

fn default_poll_interval() -> u32 {
    POLL_INTERVAL_DEFAULT_SECS
}

fn default_enabled() -> bool {
    true
}

fn explicit_null<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

pub fn validate_source_id(source_id: &str) -> Result<(), SourceValidationError> {
    let valid_chars = source_id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let alnum = |c: Option<char>| c.is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    if source_id.is_empty()
        || source_id.len() > SOURCE_ID_MAX_LEN
        || !valid_chars
        || !alnum(source_id.chars().next())
        || !alnum(source_id.chars().last())
    {
        return Err(SourceValidationError::SourceId);
    }
    Ok(())
}

fn validate_display_name(name: &str) -> Result<(), SourceValidationError> {
    let len = name.trim().chars().count();
    if len == 0 || name.chars().count() > DISPLAY_NAME_MAX_LEN {
        return Err(SourceValidationError::DisplayName);
    }
    Ok(())
}

fn validate_base_url(url: &str) -> Result<(), SourceValidationError> {
    if url.len() > BASE_URL_MAX_LEN || !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(SourceValidationError::BaseUrl);
    }
    reqwest::Url::parse(url).map_err(|_| SourceValidationError::BaseUrl)?;
    Ok(())
}

fn validate_poll_interval(secs: u32) -> Result<(), SourceValidationError> {
    if !(POLL_INTERVAL_MIN_SECS..=POLL_INTERVAL_MAX_SECS).contains(&secs) {
        return Err(SourceValidationError::PollInterval(secs));
    }
    Ok(())
}

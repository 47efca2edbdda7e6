use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

/// Application configuration loaded from environment variables.
/// Resolved once at startup and handed down through constructors.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub redis_url: String,
    pub port: u16,
    pub rust_log: String,
    /// Key passed to `pgp_sym_decrypt` when reading stored credentials.
    pub credential_master_key: Option<String>,
    pub m2m: Option<M2mConfig>,
    pub sync: SyncSettings,
}

/// Client-credentials settings for the machine-to-machine identity provider.
#[derive(Clone)]
pub struct M2mConfig {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub audience: String,
}

impl std::fmt::Debug for M2mConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("M2mConfig")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("audience", &self.audience)
            .finish()
    }
}

/// Knobs for the context sync pipeline.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub fetch_timeout: Duration,
    /// Delay before retrying a source whose last fetch failed. Independent of
    /// the source's poll interval.
    pub error_backoff: Duration,
    pub sweep_interval: Duration,
    pub sweep_limit: usize,
    pub workers: usize,
    pub pending_ttl: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(30),
            error_backoff: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(60),
            sweep_limit: 500,
            workers: 4,
            pending_ttl: Duration::from_secs(900),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        let defaults = SyncSettings::default();
        let sync = SyncSettings {
            fetch_timeout: Duration::from_secs(env_or(
                "SYNC_FETCH_TIMEOUT_SECS",
                defaults.fetch_timeout.as_secs(),
            )?),
            error_backoff: Duration::from_secs(env_or(
                "SYNC_ERROR_BACKOFF_SECS",
                defaults.error_backoff.as_secs(),
            )?),
            sweep_interval: Duration::from_secs(env_or(
                "SYNC_SWEEP_INTERVAL_SECS",
                defaults.sweep_interval.as_secs(),
            )?),
            sweep_limit: env_or("SYNC_SWEEP_LIMIT", defaults.sweep_limit)?,
            workers: env_or("SYNC_WORKERS", defaults.workers)?.max(1),
            pending_ttl: Duration::from_secs(env_or(
                "SYNC_PENDING_TTL_SECS",
                defaults.pending_ttl.as_secs(),
            )?),
        };

        Ok(Config {
            database_url: require_env("DATABASE_URL")?,
            database_max_connections: env_or("DATABASE_MAX_CONNECTIONS", 10)?,
            redis_url: require_env("REDIS_URL")?,
            port: env_or("PORT", 8080)?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            credential_master_key: optional_env("CREDENTIAL_MASTER_KEY"),
            m2m: m2m_from_env(),
            sync,
        })
    }
}

fn m2m_from_env() -> Option<M2mConfig> {
    Some(M2mConfig {
        token_url: optional_env("M2M_TOKEN_URL")?,
        client_id: optional_env("M2M_CLIENT_ID")?,
        client_secret: optional_env("M2M_CLIENT_SECRET")?,
        audience: optional_env("M2M_AUDIENCE")?,
    })
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    parse_or(key, std::env::var(key).ok(), default)
}

/// Parses an optional raw value, falling back to `default` when absent or blank.
fn parse_or<T>(key: &str, raw: Option<String>, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(default),
        Some(value) => value
            .parse::<T>()
            .with_context(|| format!("{key} must be a valid number, got '{value}'")),
    }
}

//! Machine-to-machine access tokens (OAuth 2.0 client-credentials grant).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::M2mConfig;
use crate::credentials::AuthError;

/// Refresh this long before the provider-declared expiry.
const REFRESH_MARGIN: Duration = Duration::from_secs(60);
/// Used when the token response has no `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: u64 = 300;

#[async_trait]
pub trait M2mTokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String, AuthError>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

pub struct ClientCredentialsProvider {
    http: Client,
    config: M2mConfig,
    cached: Mutex<Option<CachedToken>>,
}

impl ClientCredentialsProvider {
    pub fn new(http: Client, config: M2mConfig) -> Self {
        Self {
            http,
            config,
            cached: Mutex::new(None),
        }
    }

    async fn request_token(&self) -> Result<TokenResponse, AuthError> {
        let response = self
            .http
            .post(&self.config.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("audience", self.config.audience.as_str()),
            ])
            .send()
            .await
            .map_err(|e| AuthError::M2mUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            warn!("M2M token request rejected with HTTP {}", status.as_u16());
            return Err(AuthError::M2mUnavailable(format!(
                "token endpoint returned HTTP {}",
                status.as_u16()
            )));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| AuthError::M2mUnavailable(format!("malformed token response: {e}")))
    }
}

#[async_trait]
impl M2mTokenProvider for ClientCredentialsProvider {
    async fn access_token(&self) -> Result<String, AuthError> {
        // Held across the request so concurrent callers share one refresh.
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let response = self.request_token().await?;
        if response.access_token.is_empty() {
            return Err(AuthError::M2mUnavailable("empty access_token".into()));
        }
        let lifetime =
            Duration::from_secs(response.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS));
        debug!("Fetched M2M token valid for {}s", lifetime.as_secs());

        let value = response.access_token;
        *cached = Some(CachedToken {
            value: value.clone(),
            refresh_at: Instant::now() + lifetime.saturating_sub(REFRESH_MARGIN),
        });
        Ok(value)
    }
}

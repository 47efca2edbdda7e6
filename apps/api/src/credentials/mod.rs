//! Credential resolution for outbound context-pack requests.
//!
//! A source either references a stored credential or has none, in which case
//! the request is authenticated with a machine-to-machine token from the
//! identity provider.

pub mod m2m;
pub mod store;

use std::sync::Arc;

use reqwest::RequestBuilder;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::credentials::m2m::M2mTokenProvider;
use crate::credentials::store::CredentialStore;

pub const DEFAULT_API_KEY_HEADER: &str = "X-Api-Key";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("credential master key is not configured")]
    MissingMasterKey,

    #[error("credential {0} not found")]
    CredentialNotFound(Uuid),

    #[error("{kind} credential requires a non-empty '{field}' field")]
    MissingField { kind: &'static str, field: &'static str },

    #[error("unknown credential type: {0}")]
    UnknownCredentialType(String),

    #[error("M2M token unavailable: {0}")]
    M2mUnavailable(String),

    #[error("credential store error: {0}")]
    Store(String),
}

/// Closed set of supported credential kinds, each with its validated fields.
#[derive(Clone, PartialEq, Eq)]
pub enum CredentialKind {
    BearerAuth { token: String },
    BasicAuth { username: String, password: String },
    ApiKey { header_name: String, api_key: String },
    /// Delegates to the identity provider's machine-to-machine token.
    M2m,
}

impl std::fmt::Debug for CredentialKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BearerAuth { .. } => f.write_str("BearerAuth([REDACTED])"),
            Self::BasicAuth { username, .. } => {
                write!(f, "BasicAuth({username}, [REDACTED])")
            }
            Self::ApiKey { header_name, .. } => write!(f, "ApiKey({header_name}, [REDACTED])"),
            Self::M2m => f.write_str("M2m"),
        }
    }
}

impl CredentialKind {
    /// Builds a credential from its stored type name and decrypted field
    /// object.
    pub fn from_parts(type_name: &str, fields: &Value) -> Result<Self, AuthError> {
        match type_name {
            "bearer_auth" => Ok(Self::BearerAuth {
                token: required(fields, "bearer_auth", "token")?,
            }),
            "basic_auth" => Ok(Self::BasicAuth {
                username: required(fields, "basic_auth", "username")?,
                password: required(fields, "basic_auth", "password")?,
            }),
            "api_key" => Ok(Self::ApiKey {
                header_name: optional(fields, "header_name")
                    .unwrap_or_else(|| DEFAULT_API_KEY_HEADER.to_string()),
                api_key: required(fields, "api_key", "api_key")?,
            }),
            "m2m" => Ok(Self::M2m),
            other => Err(AuthError::UnknownCredentialType(other.to_string())),
        }
    }
}

fn optional(fields: &Value, field: &str) -> Option<String> {
    fields
        .get(field)
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

fn required(fields: &Value, kind: &'static str, field: &'static str) -> Result<String, AuthError> {
    optional(fields, field).ok_or(AuthError::MissingField { kind, field })
}

/// Concrete auth material for one request.
#[derive(Clone, PartialEq, Eq)]
pub enum ResolvedAuth {
    Bearer(String),
    Basic { username: String, password: String },
    Header { name: String, value: String },
}

impl std::fmt::Debug for ResolvedAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bearer(_) => f.write_str("Bearer([REDACTED])"),
            Self::Basic { username, .. } => write!(f, "Basic({username}, [REDACTED])"),
            Self::Header { name, .. } => write!(f, "Header({name}, [REDACTED])"),
        }
    }
}

impl ResolvedAuth {
    pub fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            Self::Bearer(token) => request.bearer_auth(token),
            Self::Basic { username, password } => request.basic_auth(username, Some(password)),
            Self::Header { name, value } => request.header(name.as_str(), value.as_str()),
        }
    }
}

/// Turns an optional credential reference into auth material. Stateless
/// apart from the credential store read.
#[derive(Clone)]
pub struct CredentialResolver {
    store: Arc<dyn CredentialStore>,
    m2m: Option<Arc<dyn M2mTokenProvider>>,
}

impl CredentialResolver {
    pub fn new(store: Arc<dyn CredentialStore>, m2m: Option<Arc<dyn M2mTokenProvider>>) -> Self {
        Self { store, m2m }
    }

    pub async fn resolve(&self, credential_id: Option<Uuid>) -> Result<ResolvedAuth, AuthError> {
        let Some(credential_id) = credential_id else {
            return self.m2m_auth().await;
        };

        let kind = self
            .store
            .load(credential_id)
            .await?
            .ok_or(AuthError::CredentialNotFound(credential_id))?;

        match kind {
            CredentialKind::BearerAuth { token } => Ok(ResolvedAuth::Bearer(token)),
            CredentialKind::BasicAuth { username, password } => {
                Ok(ResolvedAuth::Basic { username, password })
            }
            CredentialKind::ApiKey { header_name, api_key } => Ok(ResolvedAuth::Header {
                name: header_name,
                value: api_key,
            }),
            CredentialKind::M2m => self.m2m_auth().await,
        }
    }

    async fn m2m_auth(&self) -> Result<ResolvedAuth, AuthError> {
        let provider = self
            .m2m
            .as_ref()
            .ok_or_else(|| AuthError::M2mUnavailable("no identity provider configured".into()))?;
        let token = provider.access_token().await?;
        Ok(ResolvedAuth::Bearer(token))
    }
}

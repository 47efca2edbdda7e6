//! Pulls one user's context pack from one registered source.

use std::time::Duration;

use reqwest::header::{ACCEPT, ETAG, IF_NONE_MATCH};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::context::pack::{MergeableContextPack, AUDIENCE};
use crate::context::validation::{parse_context_pack, PackValidationError};
use crate::credentials::{AuthError, CredentialResolver};
use crate::models::source::ContextSource;
use crate::models::sync_state::SyncState;

const CONTEXT_PACK_PATH: &str = "/context-pack";
/// Longest slice of an error response body kept in a diagnostic.
pub const ERROR_BODY_MAX_CHARS: usize = 500;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("{0}")]
    Transport(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error(transparent)]
    Payload(#[from] PackValidationError),
}

#[derive(Debug)]
pub enum FetchOutcome {
    Fetched {
        pack: MergeableContextPack,
        /// New validator, see [`stored_etag`].
        etag: Option<String>,
        cursor: Option<String>,
    },
    /// 304. Carries the validator that was sent.
    NotModified { etag: Option<String> },
    Failed(FetchError),
}

/// Stateless apart from the HTTP client. One attempt per call; retries are
/// scheduled through `next_run_at`.
#[derive(Clone)]
pub struct ContextPackFetcher {
    http: Client,
    resolver: CredentialResolver,
}

impl ContextPackFetcher {
    pub fn new(resolver: CredentialResolver, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { http, resolver })
    }

    pub async fn fetch(
        &self,
        user_id: Uuid,
        source: &ContextSource,
        state: Option<&SyncState>,
    ) -> FetchOutcome {
        match self.try_fetch(user_id, source, state).await {
            Ok(outcome) => outcome,
            Err(e) => FetchOutcome::Failed(e),
        }
    }

    async fn try_fetch(
        &self,
        user_id: Uuid,
        source: &ContextSource,
        state: Option<&SyncState>,
    ) -> Result<FetchOutcome, FetchError> {
        let url = format!("{}{CONTEXT_PACK_PATH}", source.base_url.trim_end_matches('/'));
        let prior_etag = state.and_then(|s| s.etag.as_deref()).filter(|e| !e.is_empty());
        let prior_cursor = state
            .and_then(|s| s.since_cursor.as_deref())
            .filter(|c| !c.is_empty());

        // No network call when auth cannot be resolved.
        let auth = self.resolver.resolve(source.credential_id).await?;

        let mut query = vec![("user_id", user_id.to_string()), ("audience", AUDIENCE.to_string())];
        if let Some(cursor) = prior_cursor {
            query.push(("since", cursor.to_string()));
        }

        let mut request = self
            .http
            .get(&url)
            .query(&query)
            .header(ACCEPT, "application/json");
        request = auth.apply(request);
        if let Some(etag) = prior_etag {
            request = request.header(IF_NONE_MATCH, if_none_match(etag));
        }

        debug!("Fetching context pack from {url} for user {user_id}");
        let response = request
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_MODIFIED => {
                return Ok(FetchOutcome::NotModified {
                    etag: prior_etag.map(str::to_owned),
                })
            }
            StatusCode::OK => {}
            status => {
                let body = response.text().await.unwrap_or_default();
                let body = if body.is_empty() {
                    "no body".to_string()
                } else {
                    truncate_chars(&body, ERROR_BODY_MAX_CHARS).to_string()
                };
                return Err(FetchError::Status {
                    status: status.as_u16(),
                    body,
                });
            }
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .and_then(stored_etag);

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        let raw = parse_context_pack(&body)?;
        if raw.audience != AUDIENCE {
            warn!(
                "Source {} answered for audience '{}', expected '{AUDIENCE}'",
                source.source_id, raw.audience
            );
        }
        if let Some(subject) = &raw.subject {
            debug!("Pack from {} is about {} {}", source.source_id, subject.kind, subject.id);
        }
        let cursor = raw.advertised_cursor();

        Ok(FetchOutcome::Fetched {
            pack: raw.into_mergeable(&source.source_id),
            etag,
            cursor,
        })
    }
}

/// Form of an `ETag` header kept in sync state. A strong `"v1"` loses its
/// quotes; weak validators (`W/"v1"`) and anything else are kept verbatim.
pub fn stored_etag(header: &str) -> Option<String> {
    let header = header.trim();
    let unquoted = header
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .filter(|inner| !inner.contains('"'));
    match unquoted {
        Some(inner) => Some(inner.to_string()).filter(|v| !v.is_empty()),
        None => Some(header.to_string()).filter(|v| !v.is_empty()),
    }
}

/// Inverse of [`stored_etag`].
pub fn if_none_match(stored: &str) -> String {
    if stored.starts_with("W/") || stored.starts_with('"') {
        stored.to_string()
    } else {
        format!("\"{stored}\"")
    }
}

/// Longest prefix of `s` with at most `max` chars.
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

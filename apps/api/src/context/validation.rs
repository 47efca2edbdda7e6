use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::context::pack::{PackSubject, RawContextPack, AUDIENCE};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PackValidationError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Invalid context pack: {0}")]
    InvalidPack(String),
}

/// Wire shape of a context pack response. Every map is optional; `null`
/// and absent are treated the same.
#[derive(Debug, Deserialize)]
struct WirePack {
    schema_version: String,
    generated_at: String,
    #[serde(default)]
    audience: Option<String>,
    #[serde(default)]
    subject: Option<PackSubject>,
    #[serde(default)]
    sources: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    facts: Option<serde_json::Map<String, Value>>,
    #[serde(default)]
    recents: Option<serde_json::Map<String, Value>>,
    #[serde(default)]
    pointers: Option<BTreeMap<String, Vec<String>>>,
}

/// Parses and validates a response body. Nothing downstream sees a pack
/// that has not been through here.
pub fn parse_context_pack(body: &[u8]) -> Result<RawContextPack, PackValidationError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| PackValidationError::InvalidJson(e.to_string()))?;
    validate_context_pack(value)
}

pub fn validate_context_pack(value: Value) -> Result<RawContextPack, PackValidationError> {
    let wire: WirePack = serde_json::from_value(value)
        .map_err(|e| PackValidationError::InvalidPack(e.to_string()))?;

    let schema_version = wire.schema_version.trim();
    if schema_version.is_empty() {
        return Err(PackValidationError::InvalidPack(
            "schema_version must not be empty".to_string(),
        ));
    }

    let generated_at = parse_timestamp(&wire.generated_at).ok_or_else(|| {
        PackValidationError::InvalidPack(format!(
            "generated_at is not an ISO-8601 timestamp: '{}'",
            wire.generated_at
        ))
    })?;

    Ok(RawContextPack {
        schema_version: schema_version.to_string(),
        generated_at,
        audience: wire.audience.unwrap_or_else(|| AUDIENCE.to_string()),
        subject: wire.subject,
        sources: wire.sources.unwrap_or_default(),
        facts: wire.facts.unwrap_or_default(),
        recents: wire.recents.unwrap_or_default(),
        pointers: wire.pointers.unwrap_or_default(),
    })
}

/// Accepts RFC 3339 (`Z` or offset) and offset-less timestamps, which are
/// read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

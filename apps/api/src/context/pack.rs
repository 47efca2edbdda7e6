//! Context pack data types: the untrusted wire document, the per-source
//! mergeable form, and the merged, size-capped payload.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Audience tag sent to every source.
pub const AUDIENCE: &str = "conversa";
pub const DEFAULT_SCHEMA_VERSION: &str = "1.0";

/// Serialized `facts` must fit in this many bytes.
pub const FACTS_MAX_BYTES: usize = 8 * 1024;
/// Maximum items kept per `recents` category.
pub const RECENTS_MAX_COUNT: usize = 50;
/// Maximum identifiers kept per `pointers` category.
pub const POINTERS_MAX_PER_CATEGORY: usize = 100;

/// A source's response body after schema validation.
#[derive(Debug, Clone, PartialEq)]
pub struct RawContextPack {
    pub schema_version: String,
    pub generated_at: DateTime<Utc>,
    pub audience: String,
    pub subject: Option<PackSubject>,
    pub sources: BTreeMap<String, Value>,
    pub facts: serde_json::Map<String, Value>,
    pub recents: serde_json::Map<String, Value>,
    pub pointers: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackSubject {
    #[serde(rename = "type", default = "default_subject_type")]
    pub kind: String,
    pub id: String,
}

fn default_subject_type() -> String {
    "user".to_string()
}

impl RawContextPack {
    /// First cursor advertised under `sources.<name>.cursor`, in key order.
    pub fn advertised_cursor(&self) -> Option<String> {
        self.sources.values().find_map(|info| {
            info.get("cursor")
                .and_then(Value::as_str)
                .filter(|c| !c.is_empty())
                .map(str::to_owned)
        })
    }

    pub fn into_mergeable(self, source_id: &str) -> MergeableContextPack {
        MergeableContextPack {
            source_id: source_id.to_owned(),
            schema_version: self.schema_version,
            generated_at: self.generated_at,
            facts: self.facts,
            recents: self.recents,
            pointers: self
                .pointers
                .into_iter()
                .map(|(category, ids)| (category, Value::from(ids)))
                .collect(),
        }
    }
}

/// One source's contribution to a merge, tagged with its registry slug.
///
/// Fields stay loosely typed: the merge engine skips malformed entries
/// rather than rejecting the whole pack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeableContextPack {
    #[serde(default)]
    pub source_id: String,
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    pub generated_at: DateTime<Utc>,
    #[serde(default)]
    pub facts: serde_json::Map<String, Value>,
    #[serde(default)]
    pub recents: serde_json::Map<String, Value>,
    #[serde(default)]
    pub pointers: serde_json::Map<String, Value>,
}

fn default_schema_version() -> String {
    DEFAULT_SCHEMA_VERSION.to_string()
}

impl MergeableContextPack {
    /// Serialized size, used for the payload-size metric.
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(self).map(|b| b.len()).unwrap_or(0)
    }
}

/// Result of merging every successful pack for one user in one cycle.
///
/// Bounded: serialized `facts` ≤ [`FACTS_MAX_BYTES`], each `recents` list ≤
/// [`RECENTS_MAX_COUNT`], each `pointers` list ≤ [`POINTERS_MAX_PER_CATEGORY`]
/// with no duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedContextPayload {
    pub schema_version: String,
    pub generated_at: DateTime<Utc>,
    pub facts: BTreeMap<String, Value>,
    pub recents: BTreeMap<String, Vec<Value>>,
    pub pointers: BTreeMap<String, Vec<String>>,
}

impl MergedContextPayload {
    pub fn empty(generated_at: DateTime<Utc>) -> Self {
        Self {
            schema_version: DEFAULT_SCHEMA_VERSION.to_string(),
            generated_at,
            facts: BTreeMap::new(),
            recents: BTreeMap::new(),
            pointers: BTreeMap::new(),
        }
    }

    /// JSON document stored in `context_snapshots.payload`.
    pub fn to_snapshot_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

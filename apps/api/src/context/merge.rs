//! Merge engine: combines the packs fetched in one sync cycle into a single
//! bounded payload.
//!
//! Rules, applied in caller order (registry enumeration order):
//! - facts: first pack to define a key wins;
//! - recents: union per category, deduplicated by `id` for objects that
//!   carry one and by equality otherwise, first-seen order;
//! - pointers: union per category, deduplicated, capped while merging;
//! - generated_at: the freshest pack timestamp;
//! - schema_version: the first pack's.
//!
//! Malformed categories (a recents or pointers value that is not a list)
//! are skipped, never fatal.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::context::pack::{
    MergeableContextPack, MergedContextPayload, FACTS_MAX_BYTES, POINTERS_MAX_PER_CATEGORY,
    RECENTS_MAX_COUNT,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeLimits {
    pub facts_max_bytes: usize,
    pub recents_max_count: usize,
    pub pointers_max_per_category: usize,
}

impl Default for MergeLimits {
    fn default() -> Self {
        Self {
            facts_max_bytes: FACTS_MAX_BYTES,
            recents_max_count: RECENTS_MAX_COUNT,
            pointers_max_per_category: POINTERS_MAX_PER_CATEGORY,
        }
    }
}

/// Pure and deterministic for a given input order. No I/O.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextMerger {
    limits: MergeLimits,
}

impl ContextMerger {
    pub fn new(limits: MergeLimits) -> Self {
        Self { limits }
    }

    pub fn merge(&self, packs: &[MergeableContextPack]) -> MergedContextPayload {
        self.merge_at(packs, Utc::now())
    }

    /// `now` is only used as the timestamp of the empty payload.
    pub fn merge_at(&self, packs: &[MergeableContextPack], now: DateTime<Utc>) -> MergedContextPayload {
        let Some(first) = packs.first() else {
            return MergedContextPayload::empty(now);
        };

        let facts = cap_facts(merge_facts(packs), self.limits.facts_max_bytes);
        let mut recents = merge_recents(packs);
        for items in recents.values_mut() {
            items.truncate(self.limits.recents_max_count);
        }
        let pointers = merge_pointers(packs, self.limits.pointers_max_per_category);

        let generated_at = packs
            .iter()
            .map(|p| p.generated_at)
            .max()
            .unwrap_or(first.generated_at);

        MergedContextPayload {
            schema_version: first.schema_version.clone(),
            generated_at,
            facts,
            recents,
            pointers,
        }
    }
}

fn merge_facts(packs: &[MergeableContextPack]) -> BTreeMap<String, Value> {
    let mut merged = BTreeMap::new();
    for pack in packs {
        for (key, value) in &pack.facts {
            merged.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
    merged
}

/// Keeps keys in sorted order until the next one would push the serialized
/// map past `max_bytes`; everything from that key on is dropped.
fn cap_facts(facts: BTreeMap<String, Value>, max_bytes: usize) -> BTreeMap<String, Value> {
    if encoded_len(&facts) <= max_bytes {
        return facts;
    }

    let mut kept = BTreeMap::new();
    // "{}" plus one comma between entries.
    let mut size = 2;
    for (key, value) in facts {
        let entry = encoded_len(&key) + 1 + encoded_len(&value);
        let separator = usize::from(!kept.is_empty());
        if size + separator + entry > max_bytes {
            debug!("Facts over {max_bytes} bytes, truncating at key '{key}'");
            break;
        }
        size += separator + entry;
        kept.insert(key, value);
    }
    kept
}

fn encoded_len<T: serde::Serialize + ?Sized>(value: &T) -> usize {
    serde_json::to_vec(value).map(|b| b.len()).unwrap_or(usize::MAX / 4)
}

fn merge_recents(packs: &[MergeableContextPack]) -> BTreeMap<String, Vec<Value>> {
    let mut merged: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    let mut seen: BTreeMap<String, HashSet<String>> = BTreeMap::new();

    for pack in packs {
        for (category, values) in &pack.recents {
            let Some(items) = values.as_array() else {
                debug!(
                    "Skipping recents '{category}' from '{}': not a list",
                    pack.source_id
                );
                continue;
            };
            let bucket = merged.entry(category.clone()).or_default();
            let keys = seen.entry(category.clone()).or_default();
            for item in items {
                if keys.insert(recent_key(item)) {
                    bucket.push(item.clone());
                }
            }
        }
    }
    merged
}

/// Identity of a recents item: its `id` when it is an object with a
/// non-empty one, otherwise the whole item.
fn recent_key(item: &Value) -> String {
    match item.get("id").filter(|id| is_truthy(id)) {
        Some(id) if item.is_object() => format!("id:{id}"),
        _ => format!("eq:{item}"),
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn merge_pointers(packs: &[MergeableContextPack], cap: usize) -> BTreeMap<String, Vec<String>> {
    let mut merged: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut seen: BTreeMap<String, HashSet<String>> = BTreeMap::new();

    for pack in packs {
        for (category, values) in &pack.pointers {
            let Some(ids) = values.as_array() else {
                debug!(
                    "Skipping pointers '{category}' from '{}': not a list",
                    pack.source_id
                );
                continue;
            };
            let bucket = merged.entry(category.clone()).or_default();
            let keys = seen.entry(category.clone()).or_default();
            for id in ids.iter().filter_map(pointer_id) {
                if bucket.len() >= cap {
                    break;
                }
                if keys.insert(id.clone()) {
                    bucket.push(id);
                }
            }
        }
    }
    merged
}

fn pointer_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

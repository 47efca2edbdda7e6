//! Per-user sync run: fetch every enabled source, record per-source
//! bookkeeping, merge what came back and append a snapshot.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::context::merge::{ContextMerger, MergeLimits};
use crate::context::pack::MergeableContextPack;
use crate::context::snapshots::SnapshotStore;
use crate::errors::StoreError;
use crate::models::source::ContextSource;
use crate::sources::registry::SourceRegistry;
use crate::sources::state_store::{SyncOutcome, SyncStateStore, SyncStateUpdate};
use crate::sync::fetcher::{truncate_chars, ContextPackFetcher, FetchOutcome};
use crate::sync::metrics::{PAYLOAD_BYTES, RUNS_TOTAL, SYNC_TOTAL};

/// Page size for the enabled-source listing.
pub const SOURCE_PAGE_SIZE: i64 = 100;
/// Longest error text stored in `last_error`.
pub const LAST_ERROR_MAX_CHARS: usize = 1_000;
const LOG_ERROR_MAX_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFailure {
    pub source_id: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SyncReport {
    Synced {
        snapshot_id: Uuid,
        sources_ok: usize,
        sources_not_modified: usize,
        failures: Vec<SourceFailure>,
    },
    NoSources,
    /// Every source answered 304; nothing new to store.
    AllNotModified { sources: usize },
    AllSourcesFailed { failures: Vec<SourceFailure> },
}

impl SyncReport {
    /// `Some(user_id)` unless every source failed.
    pub fn user_id_if_ok(&self, user_id: Uuid) -> Option<Uuid> {
        match self {
            SyncReport::AllSourcesFailed { .. } => None,
            _ => Some(user_id),
        }
    }

    fn metric_label(&self) -> &'static str {
        match self {
            SyncReport::Synced { .. } => "synced",
            SyncReport::NoSources | SyncReport::AllNotModified { .. } => "noop",
            SyncReport::AllSourcesFailed { .. } => "all_failed",
        }
    }
}

pub struct SyncOrchestrator {
    sources: Arc<dyn SourceRegistry>,
    states: Arc<dyn SyncStateStore>,
    snapshots: Arc<dyn SnapshotStore>,
    fetcher: ContextPackFetcher,
    merger: ContextMerger,
    error_backoff: chrono::Duration,
}

impl SyncOrchestrator {
    pub fn new(
        sources: Arc<dyn SourceRegistry>,
        states: Arc<dyn SyncStateStore>,
        snapshots: Arc<dyn SnapshotStore>,
        fetcher: ContextPackFetcher,
        error_backoff: std::time::Duration,
    ) -> Self {
        Self {
            sources,
            states,
            snapshots,
            fetcher,
            merger: ContextMerger::new(MergeLimits::default()),
            error_backoff: chrono::Duration::from_std(error_backoff)
                .unwrap_or_else(|_| chrono::Duration::minutes(2)),
        }
    }

    pub async fn run(&self, user_id: Uuid) -> Result<SyncReport, StoreError> {
        self.run_at(user_id, Utc::now()).await
    }

    /// Only listing sources and writing the snapshot can fail the run.
    /// Everything that goes wrong for a single source ends up in its state
    /// row instead.
    pub async fn run_at(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<SyncReport, StoreError> {
        let sources: Vec<ContextSource> = self
            .sources
            .list_enabled(SOURCE_PAGE_SIZE)
            .await?
            .into_iter()
            .filter(ContextSource::is_syncable)
            .collect();

        let report = if sources.is_empty() {
            debug!("No enabled context sources for user {user_id}");
            SyncReport::NoSources
        } else {
            self.sync_sources(user_id, &sources, now).await?
        };

        counter!(RUNS_TOTAL, "result" => report.metric_label()).increment(1);
        Ok(report)
    }

    async fn sync_sources(
        &self,
        user_id: Uuid,
        sources: &[ContextSource],
        now: DateTime<Utc>,
    ) -> Result<SyncReport, StoreError> {
        let mut packs: Vec<MergeableContextPack> = Vec::new();
        let mut failures: Vec<SourceFailure> = Vec::new();
        let mut not_modified = 0;

        // Registry order is also fact precedence in the merge.
        for source in sources {
            match self.sync_source(user_id, source, now).await {
                SourceResult::Pack(pack) => packs.push(pack),
                SourceResult::NotModified => not_modified += 1,
                SourceResult::Failed(error) => failures.push(SourceFailure {
                    source_id: source.source_id.clone(),
                    error,
                }),
            }
        }

        if packs.is_empty() {
            if failures.is_empty() {
                debug!("All {not_modified} context sources unchanged for user {user_id}");
                return Ok(SyncReport::AllNotModified {
                    sources: not_modified,
                });
            }
            warn!(
                "Context sync failed for user {user_id}: all {} sources returned errors",
                failures.len()
            );
            return Ok(SyncReport::AllSourcesFailed { failures });
        }

        let merged = self.merger.merge(&packs);
        let snapshot = self.snapshots.create(user_id, &merged).await?;
        info!(
            "Context snapshot {} stored for user {user_id} from {} sources",
            snapshot.id,
            packs.len()
        );

        Ok(SyncReport::Synced {
            snapshot_id: snapshot.id,
            sources_ok: packs.len(),
            sources_not_modified: not_modified,
            failures,
        })
    }

    async fn sync_source(
        &self,
        user_id: Uuid,
        source: &ContextSource,
        now: DateTime<Utc>,
    ) -> SourceResult {
        let slug = source.source_id.as_str();
        let result = self.fetch_and_record(user_id, source, now).await;
        let status = match &result {
            SourceResult::Pack(_) => "success",
            SourceResult::NotModified => "not_modified",
            SourceResult::Failed(_) => "failure",
        };
        counter!(SYNC_TOTAL, "source_id" => slug.to_string(), "status" => status).increment(1);
        result
    }

    /// A state row that cannot be read or written fails the source, even
    /// when the fetch itself succeeded: its schedule would otherwise never
    /// advance.
    async fn fetch_and_record(
        &self,
        user_id: Uuid,
        source: &ContextSource,
        now: DateTime<Utc>,
    ) -> SourceResult {
        let slug = source.source_id.as_str();
        let state = match self.states.get_or_create(source.id, user_id).await {
            Ok(state) => state,
            Err(e) => {
                error!("Could not load sync state for user {user_id} source {slug}: {e}");
                return SourceResult::Failed(format!("sync state unavailable: {e}"));
            }
        };

        let (outcome, next_run_at, result) =
            match self.fetcher.fetch(user_id, source, Some(&state)).await {
                FetchOutcome::Fetched { pack, etag, cursor } => {
                    histogram!(PAYLOAD_BYTES, "source_id" => slug.to_string())
                        .record(pack.encoded_len() as f64);
                    info!("Context sync success for user {user_id} source {slug}");
                    (
                        SyncOutcome::Fetched { etag, cursor },
                        now + source.poll_interval(),
                        SourceResult::Pack(pack),
                    )
                }
                FetchOutcome::NotModified { etag } => {
                    debug!("Context pack unchanged for user {user_id} source {slug} (etag {etag:?})");
                    (
                        SyncOutcome::NotModified,
                        now + source.poll_interval(),
                        SourceResult::NotModified,
                    )
                }
                FetchOutcome::Failed(e) => {
                    let message = truncate_chars(&e.to_string(), LAST_ERROR_MAX_CHARS).to_string();
                    info!(
                        "Context sync failed for user {user_id} source {slug}: {}",
                        truncate_chars(&message, LOG_ERROR_MAX_CHARS)
                    );
                    (
                        SyncOutcome::Failed {
                            error: message.clone(),
                        },
                        now + self.error_backoff,
                        SourceResult::Failed(message),
                    )
                }
            };

        let update = SyncStateUpdate {
            at: now,
            next_run_at,
            outcome,
        };
        if let Err(e) = self.states.apply(state.id, &update).await {
            error!("Could not record sync state for user {user_id} source {slug}: {e}");
            return SourceResult::Failed(format!("sync state not recorded: {e}"));
        }
        result
    }
}

enum SourceResult {
    Pack(MergeableContextPack),
    NotModified,
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::m2m::M2mTokenProvider;
    use crate::credentials::CredentialResolver;
    use crate::sync::testing::{
        self, FixedM2m, MemoryCredentialStore, MemorySnapshotStore, MemorySourceRegistry,
        MemoryStateStore,
    };
    use chrono::Duration;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Harness {
        orchestrator: SyncOrchestrator,
        states: Arc<MemoryStateStore>,
        snapshots: Arc<MemorySnapshotStore>,
    }

    fn harness(sources: Vec<ContextSource>) -> Harness {
        harness_with(sources, MemoryStateStore::default())
    }

    fn harness_with(sources: Vec<ContextSource>, states: MemoryStateStore) -> Harness {
        let states = Arc::new(states);
        let snapshots = Arc::new(MemorySnapshotStore::default());
        let resolver = CredentialResolver::new(
            Arc::new(MemoryCredentialStore::default()),
            Some(Arc::new(FixedM2m::token("m2m")) as Arc<dyn M2mTokenProvider>),
        );
        let fetcher =
            ContextPackFetcher::new(resolver, std::time::Duration::from_secs(5)).unwrap();
        let orchestrator = SyncOrchestrator::new(
            Arc::new(MemorySourceRegistry::with(sources)),
            states.clone(),
            snapshots.clone(),
            fetcher,
            std::time::Duration::from_secs(120),
        );
        Harness {
            orchestrator,
            states,
            snapshots,
        }
    }

    async fn mount(server: &MockServer, prefix: &str, response: ResponseTemplate) {
        Mock::given(method("GET"))
            .and(path(format!("/{prefix}/context-pack")))
            .respond_with(response)
            .mount(server)
            .await;
    }

    fn pack(facts: serde_json::Value, recents: serde_json::Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "schema_version": "1.0",
            "generated_at": "2026-02-19T10:00:00Z",
            "facts": facts,
            "recents": recents,
        }))
    }

    fn src(server: &MockServer, slug: &str) -> ContextSource {
        testing::source(slug, &format!("{}/{slug}", server.uri()))
    }

    #[tokio::test]
    async fn test_two_sources_merge_into_one_snapshot() {
        let server = MockServer::start().await;
        mount(
            &server,
            "alpha",
            pack(
                json!({ "display_name": "Emi" }),
                json!({ "top_entities": [{ "id": "dep_1", "label": "Child" }] }),
            ),
        )
        .await;
        mount(
            &server,
            "beta",
            pack(
                json!({ "timezone": "Europe/Madrid" }),
                json!({ "top_entities": [{ "id": "dep_1", "label": "Kid" }, { "id": "dep_2" }] }),
            ),
        )
        .await;

        let h = harness(vec![src(&server, "beta"), src(&server, "alpha")]);
        let user = Uuid::new_v4();
        let report = h.orchestrator.run(user).await.unwrap();

        assert!(matches!(report, SyncReport::Synced { sources_ok: 2, .. }));
        assert_eq!(report.user_id_if_ok(user), Some(user));

        let snapshots = h.snapshots.for_user(user);
        assert_eq!(snapshots.len(), 1);
        let payload = &snapshots[0].payload;
        assert_eq!(
            payload["facts"],
            json!({ "display_name": "Emi", "timezone": "Europe/Madrid" })
        );
        let top = payload["recents"]["top_entities"].as_array().unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0]["label"], "Child");
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_successful_source() {
        let server = MockServer::start().await;
        mount(&server, "alpha", ResponseTemplate::new(500).set_body_string("down")).await;
        mount(&server, "beta", pack(json!({ "locale": "es-ES" }), json!({}))).await;

        let alpha = src(&server, "alpha");
        let h = harness(vec![alpha.clone(), src(&server, "beta")]);
        let user = Uuid::new_v4();
        let now = Utc::now();
        let report = h.orchestrator.run_at(user, now).await.unwrap();

        assert_eq!(report.user_id_if_ok(user), Some(user));
        let SyncReport::Synced { failures, .. } = &report else {
            panic!("expected Synced, got {report:?}");
        };
        assert_eq!(failures[0].source_id, "alpha");

        let snapshots = h.snapshots.for_user(user);
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].payload["facts"], json!({ "locale": "es-ES" }));

        let state = h.states.find(alpha.id, user).unwrap();
        assert_eq!(state.last_error.as_deref(), Some("HTTP 500: down"));
        assert_eq!(state.next_run_at, Some(now + Duration::seconds(120)));
        assert!(state.next_run_at < Some(now + alpha.poll_interval()));
    }

    #[tokio::test]
    async fn test_all_sources_failing_returns_none() {
        let server = MockServer::start().await;
        mount(&server, "alpha", ResponseTemplate::new(401)).await;
        mount(&server, "beta", ResponseTemplate::new(401)).await;

        let sources = vec![src(&server, "alpha"), src(&server, "beta")];
        let h = harness(sources.clone());
        let user = Uuid::new_v4();
        let report = h.orchestrator.run(user).await.unwrap();

        assert_eq!(report.user_id_if_ok(user), None);
        assert!(h.snapshots.for_user(user).is_empty());
        for source in &sources {
            let state = h.states.find(source.id, user).unwrap();
            assert_eq!(state.last_error.as_deref(), Some("HTTP 401: no body"));
        }
    }

    #[tokio::test]
    async fn test_not_modified_runs_are_idempotent() {
        let server = MockServer::start().await;
        mount(&server, "alpha", ResponseTemplate::new(304)).await;

        let alpha = src(&server, "alpha");
        let h = harness(vec![alpha.clone()]);
        let user = Uuid::new_v4();

        let first_at = Utc::now();
        let first = h.orchestrator.run_at(user, first_at).await.unwrap();
        let first_next = h.states.find(alpha.id, user).unwrap().next_run_at;

        let second_at = first_at + Duration::seconds(5);
        let second = h.orchestrator.run_at(user, second_at).await.unwrap();
        let second_next = h.states.find(alpha.id, user).unwrap().next_run_at;

        assert_eq!(first, SyncReport::AllNotModified { sources: 1 });
        assert_eq!(second, SyncReport::AllNotModified { sources: 1 });
        assert_eq!(second.user_id_if_ok(user), Some(user));
        assert!(h.snapshots.for_user(user).is_empty());
        assert!(second_next > first_next);
        assert_eq!(h.states.len(), 1);
    }

    #[tokio::test]
    async fn test_success_stores_validators_for_next_run() {
        let server = MockServer::start().await;
        mount(
            &server,
            "alpha",
            pack(json!({}), json!({})).insert_header("ETag", "\"abc\""),
        )
        .await;

        let alpha = src(&server, "alpha");
        let h = harness(vec![alpha.clone()]);
        let user = Uuid::new_v4();
        let now = Utc::now();
        h.orchestrator.run_at(user, now).await.unwrap();

        let state = h.states.find(alpha.id, user).unwrap();
        assert_eq!(state.etag.as_deref(), Some("abc"));
        assert_eq!(state.last_success_at, Some(now));
        assert_eq!(state.last_error, None);
        assert_eq!(state.next_run_at, Some(now + Duration::hours(1)));
    }

    #[tokio::test]
    async fn test_no_sources_is_noop() {
        let h = harness(Vec::new());
        let user = Uuid::new_v4();
        let report = h.orchestrator.run(user).await.unwrap();
        assert_eq!(report, SyncReport::NoSources);
        assert_eq!(report.user_id_if_ok(user), Some(user));
    }

    #[tokio::test]
    async fn test_disabled_sources_are_skipped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let mut alpha = src(&server, "alpha");
        alpha.enabled = false;
        let h = harness(vec![alpha]);
        let report = h.orchestrator.run(Uuid::new_v4()).await.unwrap();
        assert_eq!(report, SyncReport::NoSources);
    }

    /// Second run sends back what the first stored and gets a 304.
    async fn assert_validators_round_trip(etag_header: &str) {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/alpha/context-pack"))
            .and(header("if-none-match", etag_header))
            .and(query_param("since", "c-1"))
            .respond_with(ResponseTemplate::new(304))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/alpha/context-pack"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("ETag", etag_header)
                    .set_body_json(json!({
                        "schema_version": "1.0",
                        "generated_at": "2026-02-19T10:00:00Z",
                        "sources": { "alpha": { "cursor": "c-1" } },
                        "facts": { "locale": "es-ES" },
                    })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(vec![src(&server, "alpha")]);
        let user = Uuid::new_v4();
        let now = Utc::now();

        let first = h.orchestrator.run_at(user, now).await.unwrap();
        assert!(matches!(first, SyncReport::Synced { sources_ok: 1, .. }));
        let second = h
            .orchestrator
            .run_at(user, now + Duration::hours(2))
            .await
            .unwrap();
        assert_eq!(second, SyncReport::AllNotModified { sources: 1 });
        assert_eq!(h.snapshots.for_user(user).len(), 1);
    }

    #[tokio::test]
    async fn test_strong_validators_are_sent_on_next_run() {
        assert_validators_round_trip("\"v1\"").await;
    }

    #[tokio::test]
    async fn test_weak_validators_are_sent_on_next_run() {
        assert_validators_round_trip("W/\"v1\"").await;
    }

    #[tokio::test]
    async fn test_unrecorded_state_fails_the_source() {
        let server = MockServer::start().await;
        mount(&server, "alpha", pack(json!({ "locale": "es-ES" }), json!({}))).await;

        let h = harness_with(vec![src(&server, "alpha")], MemoryStateStore::read_only());
        let user = Uuid::new_v4();
        let report = h.orchestrator.run(user).await.unwrap();

        let SyncReport::AllSourcesFailed { failures } = &report else {
            panic!("expected AllSourcesFailed, got {report:?}");
        };
        assert!(failures[0].error.starts_with("sync state not recorded"));
        assert!(h.snapshots.for_user(user).is_empty());
    }
}

//! In-memory store implementations for unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::context::pack::MergedContextPayload;
use crate::context::snapshots::{payload_hash, SnapshotStore};
use crate::credentials::m2m::M2mTokenProvider;
use crate::credentials::store::CredentialStore;
use crate::credentials::{AuthError, CredentialKind};
use crate::errors::StoreError;
use crate::models::context::ContextSnapshot;
use crate::models::source::{
    ContextSource, ContextSourceUpdate, NewContextSource, SourceCapabilities, SourceStatus,
};
use crate::models::sync_state::SyncState;
use crate::models::user::User;
use crate::sources::registry::SourceRegistry;
use crate::sources::state_store::{SyncStateStore, SyncStateUpdate};
use crate::sync::queue::{QueueError, SyncQueue};
use crate::users::UserDirectory;

pub fn source(source_id: &str, base_url: &str) -> ContextSource {
    let now = Utc::now();
    ContextSource {
        id: Uuid::new_v4(),
        source_id: source_id.to_string(),
        display_name: source_id.to_string(),
        base_url: base_url.to_string(),
        credential_id: None,
        capabilities: SourceCapabilities::default(),
        poll_interval_seconds: 3600,
        enabled: true,
        status: SourceStatus::Active,
        created_at: now,
        updated_at: now,
    }
}

pub fn state_for(source: &ContextSource, user_id: Uuid) -> SyncState {
    SyncState {
        id: Uuid::new_v4(),
        source_id: source.id,
        user_id,
        last_success_at: None,
        last_attempt_at: None,
        last_error: None,
        etag: None,
        since_cursor: None,
        next_run_at: None,
    }
}

pub fn user(external_id: &str) -> User {
    User {
        id: Uuid::new_v4(),
        external_id: external_id.to_string(),
        created_at: Utc::now(),
    }
}

// ─── Credentials ────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryCredentialStore {
    credentials: Mutex<HashMap<Uuid, CredentialKind>>,
    locked: bool,
}

impl MemoryCredentialStore {
    /// Behaves like a vault with no master key configured.
    pub fn locked() -> Self {
        Self {
            locked: true,
            ..Self::default()
        }
    }

    pub fn insert(&self, kind: CredentialKind) -> Uuid {
        let id = Uuid::new_v4();
        self.credentials.lock().unwrap().insert(id, kind);
        id
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self, credential_id: Uuid) -> Result<Option<CredentialKind>, AuthError> {
        if self.locked {
            return Err(AuthError::MissingMasterKey);
        }
        Ok(self.credentials.lock().unwrap().get(&credential_id).cloned())
    }
}

pub struct FixedM2m(Option<String>);

impl FixedM2m {
    pub fn token(token: &str) -> Self {
        Self(Some(token.to_string()))
    }

    pub fn unreachable() -> Self {
        Self(None)
    }
}

#[async_trait]
impl M2mTokenProvider for FixedM2m {
    async fn access_token(&self) -> Result<String, AuthError> {
        self.0
            .clone()
            .ok_or_else(|| AuthError::M2mUnavailable("connection refused".into()))
    }
}

// ─── Registry ───────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemorySourceRegistry {
    sources: Mutex<Vec<ContextSource>>,
}

impl MemorySourceRegistry {
    pub fn with(sources: Vec<ContextSource>) -> Self {
        Self {
            sources: Mutex::new(sources),
        }
    }

    fn active_sorted(&self) -> Vec<ContextSource> {
        let mut active: Vec<_> = self
            .sources
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.status == SourceStatus::Active)
            .cloned()
            .collect();
        active.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        active
    }
}

#[async_trait]
impl SourceRegistry for MemorySourceRegistry {
    async fn list(&self, skip: i64, limit: i64) -> Result<Vec<ContextSource>, StoreError> {
        Ok(self
            .active_sorted()
            .into_iter()
            .skip(skip.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn list_enabled(&self, limit: i64) -> Result<Vec<ContextSource>, StoreError> {
        Ok(self
            .active_sorted()
            .into_iter()
            .filter(|s| s.enabled)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ContextSource>, StoreError> {
        Ok(self.active_sorted().into_iter().find(|s| s.id == id))
    }

    async fn create(&self, new: &NewContextSource) -> Result<ContextSource, StoreError> {
        let mut sources = self.sources.lock().unwrap();
        if sources.iter().any(|s| s.source_id == new.source_id) {
            return Err(StoreError::Conflict(format!(
                "source_id '{}' already exists",
                new.source_id
            )));
        }
        let mut created = source(&new.source_id, &new.base_url);
        created.display_name = new.display_name.trim().to_string();
        created.credential_id = new.credential_id;
        created.capabilities = new.capabilities.unwrap_or_default();
        created.poll_interval_seconds = new.poll_interval_seconds;
        created.enabled = new.enabled;
        sources.push(created.clone());
        Ok(created)
    }

    async fn update(
        &self,
        id: Uuid,
        changes: &ContextSourceUpdate,
    ) -> Result<Option<ContextSource>, StoreError> {
        let mut sources = self.sources.lock().unwrap();
        if let Some(new_id) = &changes.source_id {
            if sources.iter().any(|s| s.id != id && &s.source_id == new_id) {
                return Err(StoreError::Conflict(format!(
                    "source_id '{new_id}' already exists"
                )));
            }
        }
        let Some(existing) = sources
            .iter_mut()
            .find(|s| s.id == id && s.status == SourceStatus::Active)
        else {
            return Ok(None);
        };
        if let Some(v) = &changes.source_id {
            existing.source_id = v.clone();
        }
        if let Some(v) = &changes.display_name {
            existing.display_name = v.trim().to_string();
        }
        if let Some(v) = &changes.base_url {
            existing.base_url = v.clone();
        }
        if let Some(v) = changes.credential_id {
            existing.credential_id = v;
        }
        if let Some(v) = changes.capabilities {
            existing.capabilities = v;
        }
        if let Some(v) = changes.poll_interval_seconds {
            existing.poll_interval_seconds = v;
        }
        if let Some(v) = changes.enabled {
            existing.enabled = v;
        }
        existing.updated_at = Utc::now();
        Ok(Some(existing.clone()))
    }

    async fn soft_delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut sources = self.sources.lock().unwrap();
        match sources
            .iter_mut()
            .find(|s| s.id == id && s.status == SourceStatus::Active)
        {
            Some(existing) => {
                existing.status = SourceStatus::Deleted { at: Utc::now() };
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

// ─── Sync state ─────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryStateStore {
    rows: Mutex<Vec<SyncState>>,
    read_only: bool,
}

impl MemoryStateStore {
    /// Rows can be created and read, but every `apply` fails like a
    /// rejected UPDATE.
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }

    pub fn insert(&self, state: SyncState) {
        self.rows.lock().unwrap().push(state);
    }

    pub fn find(&self, source_id: Uuid, user_id: Uuid) -> Option<SyncState> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.source_id == source_id && s.user_id == user_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }
}

#[async_trait]
impl SyncStateStore for MemoryStateStore {
    async fn get_or_create(
        &self,
        source_id: Uuid,
        user_id: Uuid,
    ) -> Result<SyncState, StoreError> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(existing) = rows
            .iter()
            .find(|s| s.source_id == source_id && s.user_id == user_id)
        {
            return Ok(existing.clone());
        }
        let mut created = state_for(&source("unused", "http://unused"), user_id);
        created.source_id = source_id;
        rows.push(created.clone());
        Ok(created)
    }

    async fn apply(&self, state_id: Uuid, update: &SyncStateUpdate) -> Result<(), StoreError> {
        if self.read_only {
            return Err(StoreError::Database(sqlx::Error::Protocol(
                "value too long for column etag".into(),
            )));
        }
        if let Some(row) = self.rows.lock().unwrap().iter_mut().find(|s| s.id == state_id) {
            update.apply_to(row);
        }
        Ok(())
    }

    async fn list_for_sources(&self, source_ids: &[Uuid]) -> Result<Vec<SyncState>, StoreError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|s| source_ids.contains(&s.source_id))
            .cloned()
            .collect())
    }
}

// ─── Snapshots ──────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemorySnapshotStore {
    rows: Mutex<Vec<ContextSnapshot>>,
}

impl MemorySnapshotStore {
    pub fn for_user(&self, user_id: Uuid) -> Vec<ContextSnapshot> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn create(
        &self,
        user_id: Uuid,
        payload: &MergedContextPayload,
    ) -> Result<ContextSnapshot, StoreError> {
        let snapshot = ContextSnapshot {
            id: Uuid::new_v4(),
            user_id,
            schema_version: payload.schema_version.clone(),
            generated_at: payload.generated_at,
            payload: payload.to_snapshot_value(),
            payload_hash: Some(payload_hash(payload)),
            created_at: Utc::now(),
        };
        self.rows.lock().unwrap().push(snapshot.clone());
        Ok(snapshot)
    }

    async fn latest(&self, user_id: Uuid) -> Result<Option<ContextSnapshot>, StoreError> {
        Ok(self.history(user_id, 1).await?.into_iter().next())
    }

    async fn history(&self, user_id: Uuid, limit: i64) -> Result<Vec<ContextSnapshot>, StoreError> {
        let mut rows = self.for_user(user_id);
        rows.sort_by(|a, b| {
            (b.generated_at, b.created_at).cmp(&(a.generated_at, a.created_at))
        });
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }
}

// ─── Users and queue ────────────────────────────────────────────────────────

pub struct MemoryUserDirectory(pub Vec<User>);

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn list_active(&self, limit: i64) -> Result<Vec<User>, StoreError> {
        Ok(self.0.iter().take(limit.max(0) as usize).cloned().collect())
    }
}

#[derive(Default)]
pub struct MemoryQueue {
    items: Mutex<VecDeque<Uuid>>,
    pending: Mutex<HashSet<Uuid>>,
}

impl MemoryQueue {
    pub fn queued(&self) -> Vec<Uuid> {
        self.items.lock().unwrap().iter().copied().collect()
    }
}

#[async_trait]
impl SyncQueue for MemoryQueue {
    async fn enqueue(&self, user_id: Uuid) -> Result<bool, QueueError> {
        if !self.pending.lock().unwrap().insert(user_id) {
            return Ok(false);
        }
        self.items.lock().unwrap().push_front(user_id);
        Ok(true)
    }

    async fn dequeue(&self, _wait: Duration) -> Result<Option<Uuid>, QueueError> {
        Ok(self.items.lock().unwrap().pop_back())
    }

    async fn complete(&self, user_id: Uuid) -> Result<(), QueueError> {
        self.pending.lock().unwrap().remove(&user_id);
        Ok(())
    }
}

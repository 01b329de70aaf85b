//! Shared fixtures: an in-memory remote and seeded local stores

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use inspection_sync::config::Config;
use inspection_sync::error::RemoteError;
use inspection_sync::evidence::Passthrough;
use inspection_sync::model::{
    AuditResultMirror, ChecklistMirror, EntityMirror, ProjectMirror, ResultStatus,
};
use inspection_sync::remote::{
    Ack, ChecklistApi, ObjectStorage, ProjectBundle, ReachabilityProbe, ReadApi, Remote,
    ResultApi, ResultUpdate, UploadedObject,
};
use inspection_sync::storage::LocalStore;
use inspection_sync::sync::ChecklistPatch;
use inspection_sync::SyncService;

pub const PROJECT: &str = "p1";
pub const CHECKLIST: &str = "c1";
pub const RESULT: &str = "r1";

/// Remote operation, for failure injection and call inspection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    UpdateResult,
    UpdateChecklist,
    Upload,
    Bundle,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    UpdateResult { id: String, update: ResultUpdate, key: String },
    UpdateChecklist { id: String, patch: ChecklistPatch, key: String },
    Upload { path: String, size: usize },
    Bundle { project_id: String },
}

impl Call {
    /// Id of the record or object the call addresses
    pub fn target(&self) -> &str {
        match self {
            Call::UpdateResult { id, .. } | Call::UpdateChecklist { id, .. } => id,
            Call::Upload { path, .. } => path,
            Call::Bundle { project_id } => project_id,
        }
    }

    pub fn op(&self) -> Op {
        match self {
            Call::UpdateResult { .. } => Op::UpdateResult,
            Call::UpdateChecklist { .. } => Op::UpdateChecklist,
            Call::Upload { .. } => Op::Upload,
            Call::Bundle { .. } => Op::Bundle,
        }
    }
}

/// What the remote currently holds for a result
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteRecord {
    pub status: Option<ResultStatus>,
    pub comment: Option<String>,
    pub photos: Vec<String>,
}

#[derive(Default)]
struct FakeState {
    calls: Vec<Call>,
    keys: HashSet<String>,
    applied: usize,
    results: HashMap<String, RemoteRecord>,
    objects: HashMap<String, Vec<u8>>,
    bundles: HashMap<String, ProjectBundle>,
    scripted: HashMap<Op, VecDeque<RemoteError>>,
    targeted: HashMap<String, VecDeque<RemoteError>>,
    always: HashMap<Op, RemoteError>,
}

/// In-memory system of record that deduplicates writes by idempotency key
#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<FakeState>,
    delay: Mutex<Option<Duration>>,
    reachable: Mutex<bool>,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        let fake = Self::default();
        *fake.reachable.lock().unwrap() = true;
        Arc::new(fake)
    }

    /// Fail the next `times` calls of `op` with `error`
    pub fn fail_next(&self, op: Op, error: RemoteError, times: usize) {
        let mut state = self.state.lock().unwrap();
        let queue = state.scripted.entry(op).or_default();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    /// Fail the next `times` calls addressed to `target`
    pub fn fail_next_for(&self, target: &str, error: RemoteError, times: usize) {
        let mut state = self.state.lock().unwrap();
        let queue = state.targeted.entry(target.to_string()).or_default();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    pub fn fail_always(&self, op: Op, error: RemoteError) {
        self.state.lock().unwrap().always.insert(op, error);
    }

    pub fn heal(&self) {
        let mut state = self.state.lock().unwrap();
        state.scripted.clear();
        state.targeted.clear();
        state.always.clear();
    }

    /// Hold every write for `delay` before answering
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn set_reachable(&self, reachable: bool) {
        *self.reachable.lock().unwrap() = reachable;
    }

    pub fn set_bundle(&self, bundle: ProjectBundle) {
        let mut state = self.state.lock().unwrap();
        state.bundles.insert(bundle.project.id.clone(), bundle);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_of(&self, op: Op) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.op() == op).collect()
    }

    /// Idempotency keys sent with structured writes, in call order
    pub fn keys_sent(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::UpdateResult { key, .. } | Call::UpdateChecklist { key, .. } => Some(key),
                _ => None,
            })
            .collect()
    }

    /// Writes that changed remote state (replays excluded)
    pub fn applied(&self) -> usize {
        self.state.lock().unwrap().applied
    }

    pub fn result(&self, id: &str) -> Option<RemoteRecord> {
        self.state.lock().unwrap().results.get(id).cloned()
    }

    pub fn object(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().objects.get(path).cloned()
    }

    pub fn public_url(path: &str) -> String {
        format!("https://records.test/storage/public/audit-evidence/{}", path)
    }

    async fn enter(&self, op: Op, call: Call) -> Result<(), RemoteError> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        let target = call.target().to_string();
        state.calls.push(call);
        if let Some(error) = state.targeted.get_mut(&target).and_then(|q| q.pop_front()) {
            return Err(error);
        }
        if let Some(error) = state.scripted.get_mut(&op).and_then(|q| q.pop_front()) {
            return Err(error);
        }
        if let Some(error) = state.always.get(&op) {
            return Err(error.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl ResultApi for FakeRemote {
    async fn update_result(
        &self,
        result_id: &str,
        update: &ResultUpdate,
        idempotency_key: &str,
    ) -> Result<Ack, RemoteError> {
        let call = Call::UpdateResult {
            id: result_id.to_string(),
            update: update.clone(),
            key: idempotency_key.to_string(),
        };
        self.enter(Op::UpdateResult, call).await?;

        let mut state = self.state.lock().unwrap();
        if state.keys.insert(idempotency_key.to_string()) {
            state.applied += 1;
            let record = state.results.entry(result_id.to_string()).or_default();
            if let Some(status) = update.status {
                record.status = Some(status);
            }
            if let Some(comment) = &update.comment {
                record.comment = comment.clone();
            }
            if let Some(photos) = &update.photos {
                record.photos = photos.clone();
            }
        }
        Ok(Ack { updated_at: Some("2026-10-19T12:00:00Z".to_string()) })
    }
}

#[async_trait]
impl ChecklistApi for FakeRemote {
    async fn update_checklist(
        &self,
        checklist_id: &str,
        patch: &ChecklistPatch,
        idempotency_key: &str,
    ) -> Result<Ack, RemoteError> {
        let call = Call::UpdateChecklist {
            id: checklist_id.to_string(),
            patch: patch.clone(),
            key: idempotency_key.to_string(),
        };
        self.enter(Op::UpdateChecklist, call).await?;

        let mut state = self.state.lock().unwrap();
        if state.keys.insert(idempotency_key.to_string()) {
            state.applied += 1;
        }
        Ok(Ack::default())
    }
}

#[async_trait]
impl ObjectStorage for FakeRemote {
    async fn upload(
        &self,
        path: &str,
        bytes: &[u8],
        _content_type: &str,
    ) -> Result<UploadedObject, RemoteError> {
        let call = Call::Upload { path: path.to_string(), size: bytes.len() };
        self.enter(Op::Upload, call).await?;

        let mut state = self.state.lock().unwrap();
        state.objects.insert(path.to_string(), bytes.to_vec());
        Ok(UploadedObject { public_url: Self::public_url(path) })
    }
}

#[async_trait]
impl ReadApi for FakeRemote {
    async fn get_project_bundle(&self, project_id: &str) -> Result<ProjectBundle, RemoteError> {
        let call = Call::Bundle { project_id: project_id.to_string() };
        self.enter(Op::Bundle, call).await?;

        let state = self.state.lock().unwrap();
        state
            .bundles
            .get(project_id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(project_id.to_string()))
    }
}

#[async_trait]
impl ReachabilityProbe for FakeRemote {
    async fn probe(&self) -> bool {
        *self.reachable.lock().unwrap()
    }
}

// =============================================================================
// Seed data
// =============================================================================

pub fn project() -> ProjectMirror {
    ProjectMirror {
        id: PROJECT.into(),
        name: "Harbour Tower".into(),
        address: Some("1 Quay St".into()),
        status: "ACTIVE".into(),
        updated_at: None,
        stale: false,
    }
}

pub fn checklist() -> ChecklistMirror {
    ChecklistMirror {
        id: CHECKLIST.into(),
        project_id: PROJECT.into(),
        requirement_set_id: Some("rs-fire".into()),
        status: "IN_PROGRESS".into(),
        name: "Fire doors".into(),
        system_name: None,
        project_name: Some("Harbour Tower".into()),
        updated_at: None,
        stale: false,
        dirty: false,
    }
}

pub fn result(id: &str) -> AuditResultMirror {
    AuditResultMirror {
        id: id.into(),
        checklist_id: CHECKLIST.into(),
        requirement_id: format!("req-{}", id),
        status: ResultStatus::NotChecked,
        comment: None,
        photos: Vec::new(),
        requirement_content: Some("Doors self-close and latch".into()),
        requirement_clause: Some("4.2.1".into()),
        quantitative: None,
        updated_at: None,
        stale: false,
        dirty: false,
    }
}

/// In-memory store holding one project, one checklist and the given results
pub fn seeded_store(result_ids: &[&str]) -> Arc<LocalStore> {
    let store = LocalStore::open_in_memory().unwrap();
    store.put(&EntityMirror::Project(project())).unwrap();
    store.put(&EntityMirror::Checklist(checklist())).unwrap();
    for id in result_ids {
        store.put(&EntityMirror::AuditResult(result(id))).unwrap();
    }
    Arc::new(store)
}

/// Config with deterministic backoff; failures are not retried within one run
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.sync.jitter = false;
    config.sync.backoff_base_ms = 60_000;
    config.sync.request_timeout_ms = 2_000;
    config.connectivity.probe_enabled = false;
    config
}

/// Service over `store` and `fake`, storing captures untouched
pub fn service(config: Config, store: Arc<LocalStore>, fake: &Arc<FakeRemote>) -> Arc<SyncService> {
    let probe: Arc<dyn ReachabilityProbe> = fake.clone();
    SyncService::with_annotator(
        config,
        store,
        Remote::from_backend(fake.clone()),
        Some(probe),
        Arc::new(Passthrough),
    )
}

/// Bytes with a JPEG signature
pub fn jpeg_bytes() -> Vec<u8> {
    vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00, 0x01, 0x02]
}

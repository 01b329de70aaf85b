//! SyncService - the single entry point the UI talks to
//!
//! Owns the store, queue, connectivity monitor, engine, hydrator and
//! evidence pipeline. `init` recovers from any previous crash and starts a
//! background loop that syncs on reconnect, on a fixed interval and on
//! demand; `dispose` stops it.

use std::sync::Arc;

use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{CaptureError, HydrationError, QueueError, StoreError};
use crate::evidence::{CaptureMetadata, EvidenceAnnotator, EvidencePipeline, JpegNormalizer};
use crate::hydration::{HydrationStats, Hydrator};
use crate::model::{
    EntityMirror, EvidenceBlob, EvidenceRef, PhotoRef, QuantitativeFields, ResultStatus,
};
use crate::remote::{ReachabilityProbe, Remote};
use crate::storage::LocalStore;
use crate::sync::queue::result_patch;
use crate::sync::{
    ChecklistPatch, EnqueueOutcome, Mutation, MutationId, MutationPayload, MutationQueue,
    QueueCounts, RetryPolicy, SyncEngine, SyncReport,
};

/// Fields to change on an audit result; `None` keeps the current value
#[derive(Debug, Clone, Default)]
pub struct ResultChange {
    pub status: Option<ResultStatus>,
    pub comment: Option<String>,
    pub photos: Option<Vec<PhotoRef>>,
    pub quantitative: Option<QuantitativeFields>,
}

struct Background {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct SyncService {
    config: Config,
    store: Arc<LocalStore>,
    queue: Arc<MutationQueue>,
    monitor: Arc<ConnectivityMonitor>,
    engine: Arc<SyncEngine>,
    hydrator: Hydrator,
    evidence: EvidencePipeline,
    trigger: Notify,
    background: Mutex<Option<Background>>,
}

impl SyncService {
    /// Wire the service over an open store
    pub fn new(
        config: Config,
        store: Arc<LocalStore>,
        remote: Remote,
        probe: Option<Arc<dyn ReachabilityProbe>>,
    ) -> Arc<Self> {
        let annotator: Arc<dyn EvidenceAnnotator> = Arc::new(JpegNormalizer::new(
            config.evidence.max_dimension,
            config.evidence.jpeg_quality,
        ));
        Self::with_annotator(config, store, remote, probe, annotator)
    }

    pub fn with_annotator(
        config: Config,
        store: Arc<LocalStore>,
        remote: Remote,
        probe: Option<Arc<dyn ReachabilityProbe>>,
        annotator: Arc<dyn EvidenceAnnotator>,
    ) -> Arc<Self> {
        let queue = Arc::new(MutationQueue::new(
            store.clone(),
            RetryPolicy::from_config(&config.sync),
        ));
        let monitor = Arc::new(ConnectivityMonitor::new(&config.connectivity, probe));
        let engine = Arc::new(SyncEngine::new(
            queue.clone(),
            remote.clone(),
            monitor.clone(),
            config.sync.clone(),
        ));
        let hydrator = Hydrator::new(store.clone(), remote.reader.clone(), config.sync.request_timeout());
        let evidence = EvidencePipeline::new(
            store.clone(),
            engine.clone(),
            annotator,
            config.evidence.clone(),
        );

        Arc::new(Self {
            config,
            store,
            queue,
            monitor,
            engine,
            hydrator,
            evidence,
            trigger: Notify::new(),
            background: Mutex::new(None),
        })
    }

    /// Open the store named by the config and wire the service
    pub fn open(
        config: Config,
        remote: Remote,
        probe: Option<Arc<dyn ReachabilityProbe>>,
    ) -> Result<Arc<Self>, StoreError> {
        let store = Arc::new(LocalStore::open(&config.store.data_dir)?);
        Ok(Self::new(config, store, remote, probe))
    }

    /// Crash recovery, then start the background loop
    pub async fn init(self: &Arc<Self>) -> Result<(), StoreError> {
        self.queue.recover_in_flight()?;
        self.queue.recover_dirty()?;

        let mut background = self.background.lock().await;
        if background.is_some() {
            debug!("Sync service already initialized");
            return Ok(());
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let service = self.clone();
        let handle = tokio::spawn(async move { service.run_loop(shutdown_rx).await });
        *background = Some(Background { shutdown, handle });

        let counts = self.queue.counts()?;
        info!(
            pending = counts.pending,
            failed = counts.failed,
            dead = counts.dead,
            online = self.monitor.is_online(),
            "Sync service started"
        );
        Ok(())
    }

    /// Stop the background loop and wait for it to finish
    pub async fn dispose(&self) {
        let background = self.background.lock().await.take();
        if let Some(Background { shutdown, handle }) = background {
            let _ = shutdown.send(true);
            if let Err(e) = handle.await {
                error!("Sync loop ended abnormally: {}", e);
            }
            info!("Sync service stopped");
        }
    }

    async fn run_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut online = self.monitor.subscribe();
        let mut was_online = *online.borrow_and_update();
        let mut ticker = tokio::time::interval(self.config.sync.sync_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                changed = online.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let now_online = *online.borrow_and_update();
                    if now_online && !was_online {
                        info!("Back online, syncing");
                        self.sync_and_log("reconnect").await;
                    }
                    was_online = now_online;
                }
                _ = self.trigger.notified() => {
                    self.monitor.recheck().await;
                    self.sync_and_log("manual").await;
                }
                _ = ticker.tick() => {
                    if self.monitor.is_stale() {
                        self.monitor.recheck().await;
                    }
                    if self.monitor.is_online() {
                        self.sync_and_log("interval").await;
                    }
                }
            }
        }
        debug!("Sync loop exited");
    }

    async fn sync_and_log(&self, reason: &str) {
        let report = self.engine.process_sync_queue().await;
        if report.already_running {
            debug!(reason, "Sync skipped, another run is active");
        } else if !report.errors.is_empty() {
            error!(reason, errors = ?report.errors, "Sync run had local errors");
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn is_online(&self) -> bool {
        self.monitor.is_online()
    }

    pub fn is_syncing(&self) -> bool {
        self.engine.is_syncing()
    }

    /// Platform link-layer signal
    pub fn set_link_online(&self, up: bool) {
        self.monitor.set_link_online(up);
    }

    /// Ask the background loop for a sync without waiting for it
    pub fn request_sync(&self) {
        self.trigger.notify_one();
    }

    /// Optimistic local update of an audit result, queued for the remote
    pub fn update_result(&self, result_id: &str, change: ResultChange) -> Result<EnqueueOutcome, StoreError> {
        let mut result = self
            .store
            .get_result(result_id)?
            .ok_or_else(|| StoreError::NotFound(format!("audit result {}", result_id)))?;

        if let Some(status) = change.status {
            result.status = status;
        }
        if let Some(comment) = change.comment {
            result.comment = if comment.is_empty() { None } else { Some(comment) };
        }
        if let Some(photos) = change.photos {
            result.photos = photos;
        }
        if let Some(quantitative) = change.quantitative {
            result.quantitative = Some(quantitative.recomputed());
        }

        let payload = MutationPayload::UpdateResult(result_patch(&result));
        self.queue
            .apply_and_enqueue(&EntityMirror::AuditResult(result), &payload)
    }

    /// Optimistic local update of a checklist, queued for the remote
    pub fn update_checklist(&self, checklist_id: &str, patch: ChecklistPatch) -> Result<EnqueueOutcome, StoreError> {
        let mut checklist = self
            .store
            .get_checklist(checklist_id)?
            .ok_or_else(|| StoreError::NotFound(format!("checklist {}", checklist_id)))?;

        if let Some(status) = &patch.status {
            checklist.status = status.clone();
        }
        if let Some(name) = &patch.name {
            checklist.name = name.clone();
        }
        if let Some(system_name) = &patch.system_name {
            checklist.system_name = Some(system_name.clone());
        }

        let payload = MutationPayload::UpdateChecklist(patch);
        self.queue
            .apply_and_enqueue(&EntityMirror::Checklist(checklist), &payload)
    }

    /// Capture a photo for a result
    pub async fn save_photo(
        &self,
        result_id: &str,
        project_id: &str,
        binary: Vec<u8>,
    ) -> Result<EvidenceRef, CaptureError> {
        self.capture(result_id, binary, CaptureMetadata::for_project(project_id))
            .await
    }

    /// Capture a photo with full provenance metadata
    pub async fn capture(
        &self,
        result_id: &str,
        binary: Vec<u8>,
        metadata: CaptureMetadata,
    ) -> Result<EvidenceRef, CaptureError> {
        let evidence = self.evidence.capture(result_id, binary, metadata).await?;
        if self.monitor.is_online() {
            self.request_sync();
        }
        Ok(evidence)
    }

    pub async fn hydrate_project(&self, project_id: &str) -> Result<HydrationStats, HydrationError> {
        self.hydrator.hydrate_project(project_id).await
    }

    /// Drain the queue now; never fails as a whole
    pub async fn process_sync_queue(&self) -> SyncReport {
        self.engine.process_sync_queue().await
    }

    /// Re-probe reachability, then drain the queue
    pub async fn sync_now(&self) -> SyncReport {
        self.monitor.recheck().await;
        self.engine.process_sync_queue().await
    }

    pub async fn upload_pending(&self) -> Result<SyncReport, StoreError> {
        self.evidence.upload_pending().await
    }

    pub fn load_evidence(&self, evidence_id: &str) -> Result<Option<EvidenceBlob>, StoreError> {
        self.evidence.load(evidence_id)
    }

    pub fn evidence_for_result(&self, result_id: &str) -> Result<Vec<EvidenceBlob>, StoreError> {
        self.evidence.for_result(result_id)
    }

    pub fn queue_counts(&self) -> Result<QueueCounts, StoreError> {
        self.queue.counts()
    }

    pub fn dead_mutations(&self) -> Result<Vec<Mutation>, StoreError> {
        self.queue.dead()
    }

    pub fn retry_dead(&self, id: MutationId) -> Result<Mutation, QueueError> {
        let retried = self.queue.retry_dead(id)?;
        if self.monitor.is_online() {
            self.request_sync();
        }
        Ok(retried)
    }

    pub fn discard_dead(&self, id: MutationId) -> Result<Mutation, QueueError> {
        self.queue.discard_dead(id)
    }
}

//! Sync engine
//!
//! Drains the mutation queue against the remote collaborators. A run keeps
//! up to `max_concurrent` structured mutations and `max_concurrent_uploads`
//! uploads in flight, refilling each lane as slots free up, and stops
//! claiming new work as soon as the device goes offline. Only one run is
//! active at a time; a second caller gets a report flagged
//! `already_running`.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use super::mutation::{
    ChecklistPatch, DeadReason, Mutation, MutationPayload, ResultPatch, UploadImage,
};
use super::queue::{MutationQueue, Settled};
use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{FailureClass, RemoteError, StoreError};
use crate::model::{Collection, PhotoRef};
use crate::remote::{Ack, Remote, ResultUpdate};
use crate::storage::{entities, evidence, Lane, LocalStore};

/// Outcome of one evidence upload during a run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadOutcome {
    pub evidence_id: String,
    pub result_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Summary of one queue run; runs never fail as a whole
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    /// Mutations acknowledged and removed
    pub succeeded: usize,
    /// Transient failures scheduled for retry
    pub failed: usize,
    /// Mutations moved to the dead state
    pub dead: usize,
    /// Unsettled mutations left after the run
    pub remaining: u64,
    /// Another run was active; nothing was done
    pub already_running: bool,
    /// The device was offline at some point, so dispatch stopped early
    pub stopped_offline: bool,
    /// Local errors that did not belong to a single mutation
    pub errors: Vec<String>,
    pub uploads: Vec<UploadOutcome>,
}

/// Which lanes a run drains
#[derive(Debug, Clone, Copy)]
pub struct Lanes {
    pub structured: bool,
    pub uploads: bool,
}

impl Lanes {
    pub const ALL: Lanes = Lanes { structured: true, uploads: true };
    pub const UPLOADS: Lanes = Lanes { structured: false, uploads: true };
}

enum DispatchFailure {
    Remote(RemoteError),
    MissingBlob(String),
    Store(StoreError),
}

impl From<RemoteError> for DispatchFailure {
    fn from(e: RemoteError) -> Self {
        DispatchFailure::Remote(e)
    }
}

impl From<StoreError> for DispatchFailure {
    fn from(e: StoreError) -> Self {
        DispatchFailure::Store(e)
    }
}

/// Clears the syncing flag when a run ends, including on panic
struct SyncingGuard<'a>(&'a AtomicBool);

impl<'a> SyncingGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| SyncingGuard(flag))
    }
}

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SyncEngine {
    store: Arc<LocalStore>,
    queue: Arc<MutationQueue>,
    remote: Remote,
    monitor: Arc<ConnectivityMonitor>,
    config: SyncConfig,
    syncing: AtomicBool,
    /// Serializes remote writes to the same result's fields
    result_locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl SyncEngine {
    pub fn new(
        queue: Arc<MutationQueue>,
        remote: Remote,
        monitor: Arc<ConnectivityMonitor>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store: queue.store().clone(),
            queue,
            remote,
            monitor,
            config,
            syncing: AtomicBool::new(false),
            result_locks: DashMap::new(),
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    pub fn queue(&self) -> &Arc<MutationQueue> {
        &self.queue
    }

    /// Drain every lane
    pub async fn process_sync_queue(&self) -> SyncReport {
        self.run(Lanes::ALL).await
    }

    /// Drain only evidence uploads
    pub async fn process_uploads(&self) -> SyncReport {
        self.run(Lanes::UPLOADS).await
    }

    async fn run(&self, lanes: Lanes) -> SyncReport {
        let Some(_guard) = SyncingGuard::acquire(&self.syncing) else {
            debug!("Sync already running");
            return SyncReport { already_running: true, ..Default::default() };
        };

        let started = Instant::now();
        let mut report = SyncReport::default();

        if lanes.structured {
            if let Err(e) = self.queue.recover_dirty() {
                error!("Dirty recovery failed: {}", e);
                report.errors.push(format!("dirty recovery: {}", e));
            }
        }

        let mut in_flight = FuturesUnordered::new();
        let mut structured_active = 0usize;
        let mut uploads_active = 0usize;

        loop {
            if self.monitor.is_online() {
                if lanes.structured {
                    let free = self.config.max_concurrent.saturating_sub(structured_active);
                    match self.queue.next_batch(Lane::Structured, free) {
                        Ok(batch) => {
                            for mutation in batch {
                                structured_active += 1;
                                in_flight.push(self.dispatch(mutation));
                            }
                        }
                        Err(e) => report.errors.push(format!("claim: {}", e)),
                    }
                }
                if lanes.uploads {
                    let free = self.config.max_concurrent_uploads.saturating_sub(uploads_active);
                    match self.queue.next_batch(Lane::Uploads, free) {
                        Ok(batch) => {
                            for mutation in batch {
                                uploads_active += 1;
                                in_flight.push(self.dispatch(mutation));
                            }
                        }
                        Err(e) => report.errors.push(format!("claim: {}", e)),
                    }
                }
            } else {
                report.stopped_offline = true;
            }

            // Nothing claimed and nothing running: the run is done
            let Some((mutation, outcome)) = in_flight.next().await else {
                break;
            };
            if mutation.mutation_type.is_upload() {
                uploads_active -= 1;
            } else {
                structured_active -= 1;
            }
            self.settle(mutation, outcome, &mut report);
        }

        // Runs are exclusive and every dispatch has finished
        self.result_locks.clear();

        match self.queue.counts() {
            Ok(counts) => report.remaining = counts.unsettled(),
            Err(e) => report.errors.push(format!("counts: {}", e)),
        }

        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            dead = report.dead,
            remaining = report.remaining,
            offline = report.stopped_offline,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Sync run finished"
        );
        report
    }

    async fn call<T, F>(&self, request: F) -> Result<T, RemoteError>
    where
        F: Future<Output = Result<T, RemoteError>>,
    {
        match tokio::time::timeout(self.config.request_timeout(), request).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout),
        }
    }

    fn result_lock(&self, result_id: &str) -> Arc<AsyncMutex<()>> {
        self.result_locks
            .entry(result_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    async fn dispatch(&self, mutation: Mutation) -> (Mutation, Result<Option<String>, DispatchFailure>) {
        let key = mutation.idempotency_key();
        debug!(
            id = %mutation.id,
            target = %mutation.target_id,
            kind = mutation.mutation_type.as_str(),
            attempt = mutation.attempts + 1,
            "Dispatching mutation"
        );
        let outcome = match &mutation.payload {
            MutationPayload::UpdateResult(patch) => self
                .send_result(&mutation.target_id, patch, &key)
                .await
                .map(|_| None),
            MutationPayload::UpdateChecklist(patch) => self
                .send_checklist(&mutation.target_id, patch, &key)
                .await
                .map(|_| None),
            MutationPayload::UploadImage(job) => self
                .send_upload(&mutation.target_id, job, &key)
                .await
                .map(Some),
        };
        (mutation, outcome)
    }

    /// Public URLs for a photo list; local refs without an upload are left out
    fn resolve_photos(&self, photos: &[PhotoRef]) -> Result<Vec<String>, StoreError> {
        self.store.with_conn(|conn| {
            let mut urls = Vec::with_capacity(photos.len());
            for photo in photos {
                match photo {
                    PhotoRef::Remote { url, .. } => urls.push(url.clone()),
                    PhotoRef::Local { evidence_id } => {
                        if let Some(blob) = evidence::get_blob_meta(conn, evidence_id)? {
                            if let (true, Some(url)) = (blob.uploaded, blob.public_url) {
                                urls.push(url);
                            }
                        }
                    }
                }
            }
            Ok(urls)
        })
    }

    fn record_ack(&self, collection: Collection, id: &str, ack: &Ack) -> Result<(), StoreError> {
        if let Some(updated_at) = &ack.updated_at {
            self.store
                .with_conn(|conn| entities::set_updated_at(conn, collection, id, updated_at))?;
        }
        Ok(())
    }

    async fn send_result(
        &self,
        result_id: &str,
        patch: &ResultPatch,
        key: &str,
    ) -> Result<(), DispatchFailure> {
        let lock = self.result_lock(result_id);
        let _held = lock.lock().await;

        // Photos linked since this write was queued must not be dropped
        let photos = match self.store.get_result(result_id)? {
            Some(current) => self.resolve_photos(&current.photos)?,
            None => self.resolve_photos(&patch.photos)?,
        };
        let update = ResultUpdate {
            status: Some(patch.status),
            comment: Some(patch.comment.clone()),
            photos: Some(photos),
            quantitative: patch.quantitative.clone().map(|q| q.recomputed()),
        };
        let ack = self
            .call(self.remote.results.update_result(result_id, &update, key))
            .await?;
        self.record_ack(Collection::AuditResults, result_id, &ack)?;
        Ok(())
    }

    async fn send_checklist(
        &self,
        checklist_id: &str,
        patch: &ChecklistPatch,
        key: &str,
    ) -> Result<(), DispatchFailure> {
        let ack = self
            .call(self.remote.checklists.update_checklist(checklist_id, patch, key))
            .await?;
        self.record_ack(Collection::Checklists, checklist_id, &ack)?;
        Ok(())
    }

    /// Upload the binary (unless a previous attempt already did), then link
    /// the resulting URL into the owning result.
    async fn send_upload(
        &self,
        evidence_id: &str,
        job: &UploadImage,
        key: &str,
    ) -> Result<String, DispatchFailure> {
        let blob = self
            .store
            .with_conn(|conn| evidence::get_blob(conn, evidence_id))?
            .ok_or_else(|| DispatchFailure::MissingBlob(evidence_id.to_string()))?;

        let public_url = match (blob.uploaded, blob.public_url) {
            (true, Some(url)) => url,
            _ => {
                let uploaded = self
                    .call(self.remote.storage.upload(&job.path, &blob.binary, &job.content_type))
                    .await?;
                self.store.with_tx(|tx| {
                    evidence::mark_uploaded(tx, evidence_id, &uploaded.public_url)?;
                    if let Some(mut result) = entities::get_result(tx, &job.result_id)? {
                        for photo in result.photos.iter_mut() {
                            if matches!(photo, PhotoRef::Local { evidence_id: id } if id.as_str() == evidence_id) {
                                *photo = PhotoRef::Remote {
                                    url: uploaded.public_url.clone(),
                                    evidence_id: Some(evidence_id.to_string()),
                                };
                            }
                        }
                        entities::put_result(tx, &result)?;
                    }
                    Ok(())
                })?;
                info!(evidence = %evidence_id, url = %uploaded.public_url, "Evidence uploaded");
                uploaded.public_url
            }
        };

        let lock = self.result_lock(&job.result_id);
        let _held = lock.lock().await;

        let Some(result) = self.store.get_result(&job.result_id)? else {
            debug!(evidence = %evidence_id, "Result gone locally, skipping link");
            return Ok(public_url);
        };
        if !result.photos.iter().any(|p| p.evidence_id() == Some(evidence_id)) {
            debug!(evidence = %evidence_id, "Photo removed from result, skipping link");
            return Ok(public_url);
        }

        let update = ResultUpdate::photos_only(self.resolve_photos(&result.photos)?);
        let link_key = format!("{}:link", key);
        let ack = self
            .call(self.remote.results.update_result(&job.result_id, &update, &link_key))
            .await?;
        self.record_ack(Collection::AuditResults, &job.result_id, &ack)?;
        Ok(public_url)
    }

    /// Record a dispatch outcome in the queue and the report
    fn settle(
        &self,
        mutation: Mutation,
        outcome: Result<Option<String>, DispatchFailure>,
        report: &mut SyncReport,
    ) {
        let upload_job = match &mutation.payload {
            MutationPayload::UploadImage(job) => Some(job.clone()),
            _ => None,
        };

        let failure: Option<String> = match outcome {
            Ok(public_url) => {
                if let Err(e) = self.queue.complete(mutation.id) {
                    // The remote has it; a replay after restart is deduplicated by key
                    error!(id = %mutation.id, "Failed to remove acknowledged mutation: {}", e);
                    report.errors.push(format!("complete {}: {}", mutation.id, e));
                }
                report.succeeded += 1;
                if let Some(job) = &upload_job {
                    report.uploads.push(UploadOutcome {
                        evidence_id: mutation.target_id.clone(),
                        result_id: job.result_id.clone(),
                        public_url,
                        error: None,
                    });
                }
                None
            }
            Err(DispatchFailure::MissingBlob(id)) => {
                let message = format!("evidence binary {} is missing", id);
                match self
                    .queue
                    .kill(&mutation, mutation.attempts + 1, DeadReason::MissingBlob, &message)
                {
                    Ok(()) => report.dead += 1,
                    Err(e) => report.errors.push(format!("kill {}: {}", mutation.id, e)),
                }
                Some(message)
            }
            Err(DispatchFailure::Store(e)) => {
                let message = format!("local store: {}", e);
                self.apply_failure(&mutation, FailureClass::Transient, &message, report);
                Some(message)
            }
            Err(DispatchFailure::Remote(e)) => {
                let message = e.to_string();
                self.apply_failure(&mutation, e.failure_class(), &message, report);
                Some(message)
            }
        };

        if let (Some(job), Some(error)) = (upload_job, failure) {
            report.uploads.push(UploadOutcome {
                evidence_id: mutation.target_id.clone(),
                result_id: job.result_id,
                public_url: None,
                error: Some(error),
            });
        }
    }

    fn apply_failure(
        &self,
        mutation: &Mutation,
        class: FailureClass,
        message: &str,
        report: &mut SyncReport,
    ) {
        match self.queue.fail(mutation, class, message) {
            Ok(Settled::Retrying { attempts, retry_in }) => {
                warn!(
                    id = %mutation.id,
                    target = %mutation.target_id,
                    attempts,
                    retry_in_ms = retry_in.as_millis() as u64,
                    error = %message,
                    "Mutation failed, will retry"
                );
                report.failed += 1;
            }
            Ok(Settled::Dead(reason)) => {
                report.dead += 1;
                if reason == DeadReason::Conflict {
                    self.flag_conflict(mutation);
                }
            }
            Err(e) => {
                error!(id = %mutation.id, "Failed to record mutation failure: {}", e);
                report.errors.push(format!("fail {}: {}", mutation.id, e));
            }
        }
    }

    /// A conflicting write means the local mirror no longer matches the remote
    fn flag_conflict(&self, mutation: &Mutation) {
        let (collection, id) = match &mutation.payload {
            MutationPayload::UpdateResult(_) => (Collection::AuditResults, mutation.target_id.as_str()),
            MutationPayload::UpdateChecklist(_) => (Collection::Checklists, mutation.target_id.as_str()),
            MutationPayload::UploadImage(job) => (Collection::AuditResults, job.result_id.as_str()),
        };
        if let Err(e) = self.store.flag_stale(collection, id) {
            error!(target = %id, "Failed to flag stale mirror: {}", e);
        }
    }
}

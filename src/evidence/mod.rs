//! Evidence pipeline - photo capture, local persistence and upload
//!
//! A capture is normalized, written to the `images` table, referenced from
//! its result as a local photo, and queued for upload, all in one
//! transaction. It is renderable from the local store the moment
//! [`EvidencePipeline::capture`] returns; the upload and the link of its
//! public URL into the result happen later in the sync engine.

pub mod annotate;

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EvidenceConfig;
use crate::error::{CaptureError, StoreError};
use crate::model::{EvidenceBlob, EvidenceRef, GeoPoint, PhotoRef, Provenance};
use crate::storage::{entities, evidence, queue, LocalStore};
use crate::sync::mutation::{MutationPayload, UploadImage};
use crate::sync::{SyncEngine, SyncReport};

pub use annotate::{Annotated, EvidenceAnnotator, JpegNormalizer, Passthrough};

/// Caller-supplied context for a capture
#[derive(Debug, Clone, Default)]
pub struct CaptureMetadata {
    pub project_id: String,
    /// Defaults to now
    pub captured_at: Option<DateTime<Utc>>,
    pub geolocation: Option<GeoPoint>,
    /// Defaults to the result's requirement clause
    pub requirement_clause: Option<String>,
    /// Defaults to the owning checklist's project name
    pub project_name: Option<String>,
}

impl CaptureMetadata {
    pub fn for_project(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            ..Default::default()
        }
    }
}

fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        _ => "bin",
    }
}

pub struct EvidencePipeline {
    store: Arc<LocalStore>,
    engine: Arc<SyncEngine>,
    annotator: Arc<dyn EvidenceAnnotator>,
    config: EvidenceConfig,
}

impl EvidencePipeline {
    pub fn new(
        store: Arc<LocalStore>,
        engine: Arc<SyncEngine>,
        annotator: Arc<dyn EvidenceAnnotator>,
        config: EvidenceConfig,
    ) -> Self {
        Self {
            store,
            engine,
            annotator,
            config,
        }
    }

    /// Object storage path for a blob
    pub fn upload_path(&self, project_id: &str, result_id: &str, evidence_id: &str, content_type: &str) -> String {
        format!(
            "{}/{}/{}/{}.{}",
            self.config.bucket_prefix,
            project_id,
            result_id,
            evidence_id,
            extension_for(content_type)
        )
    }

    /// Persist a photo locally and queue its upload
    pub async fn capture(
        &self,
        result_id: &str,
        raw: Vec<u8>,
        metadata: CaptureMetadata,
    ) -> Result<EvidenceRef, CaptureError> {
        if raw.is_empty() {
            return Err(CaptureError::EmptyBinary);
        }
        let result = self
            .store
            .get_result(result_id)?
            .ok_or_else(|| CaptureError::UnknownResult(result_id.to_string()))?;

        let project_name = match metadata.project_name {
            Some(name) => Some(name),
            None => self
                .store
                .get_checklist(&result.checklist_id)?
                .and_then(|c| c.project_name),
        };
        let provenance = Provenance {
            captured_at: metadata
                .captured_at
                .unwrap_or_else(Utc::now)
                .to_rfc3339_opts(SecondsFormat::Secs, true),
            geolocation: metadata.geolocation,
            requirement_clause: metadata.requirement_clause.or(result.requirement_clause.clone()),
            project_name,
        };

        let annotator = self.annotator.clone();
        let annotate_provenance = provenance.clone();
        let annotated = tokio::task::spawn_blocking(move || annotator.annotate(&raw, &annotate_provenance))
            .await
            .map_err(|e| StoreError::Internal(format!("Annotation task failed: {}", e)))?;

        let size = annotated.bytes.len() as u64;

        let evidence_id = format!("{}-{}", result_id, Uuid::new_v4().simple());
        let blob = EvidenceBlob {
            id: evidence_id.clone(),
            result_id: result_id.to_string(),
            project_id: metadata.project_id.clone(),
            content_hash: evidence::compute_hash(&annotated.bytes),
            byte_size: size,
            binary: annotated.bytes,
            content_type: annotated.content_type,
            uploaded: false,
            public_url: None,
            provenance: Some(provenance),
            created_at: Utc::now().to_rfc3339(),
        };
        let job = MutationPayload::UploadImage(UploadImage {
            result_id: result_id.to_string(),
            project_id: metadata.project_id.clone(),
            path: self.upload_path(&metadata.project_id, result_id, &evidence_id, &blob.content_type),
            content_type: blob.content_type.clone(),
        });

        let quota = self.config.max_local_bytes;
        let stored = self.store.with_tx(|tx| {
            let Some(mut result) = entities::get_result(tx, result_id)? else {
                return Ok(Err(CaptureError::UnknownResult(result_id.to_string())));
            };
            // Checked under the store lock so concurrent captures see each other
            if quota > 0 {
                let available = quota.saturating_sub(evidence::total_bytes(tx)?);
                if size > available {
                    return Ok(Err(CaptureError::StorageExhausted { needed: size, available }));
                }
            }
            evidence::insert_blob(tx, &blob)?;
            result.photos.push(PhotoRef::Local { evidence_id: evidence_id.clone() });
            entities::put_result(tx, &result)?;
            queue::insert_mutation(tx, &evidence_id, &job, crate::sync::queue::now_ms())?;
            Ok(Ok(()))
        })?;
        if let Err(e) = stored {
            if let CaptureError::StorageExhausted { available, .. } = &e {
                warn!(result = %result_id, size, available, "Evidence quota exhausted");
            }
            return Err(e);
        }

        info!(evidence = %evidence_id, result = %result_id, size, "Evidence captured");
        Ok(EvidenceRef {
            evidence_id,
            result_id: result_id.to_string(),
            public_url: None,
        })
    }

    /// Queue uploads for blobs that lost their upload job, then drain uploads
    pub async fn upload_pending(&self) -> Result<SyncReport, StoreError> {
        let requeued = self.requeue_orphans()?;
        if requeued > 0 {
            info!(requeued, "Re-queued uploads for orphaned evidence");
        }
        Ok(self.engine.process_uploads().await)
    }

    fn requeue_orphans(&self) -> Result<usize, StoreError> {
        self.store.with_tx(|tx| {
            let mut requeued = 0;
            for blob in evidence::pending_blobs(tx)? {
                if queue::has_upload_for(tx, &blob.id)? {
                    continue;
                }
                debug!(evidence = %blob.id, "Pending evidence has no upload job");
                let job = MutationPayload::UploadImage(UploadImage {
                    result_id: blob.result_id.clone(),
                    project_id: blob.project_id.clone(),
                    path: self.upload_path(&blob.project_id, &blob.result_id, &blob.id, &blob.content_type),
                    content_type: blob.content_type.clone(),
                });
                queue::insert_mutation(tx, &blob.id, &job, crate::sync::queue::now_ms())?;
                requeued += 1;
            }
            Ok(requeued)
        })
    }

    /// Blob with its binary, for rendering
    pub fn load(&self, evidence_id: &str) -> Result<Option<EvidenceBlob>, StoreError> {
        self.store.with_conn(|conn| evidence::get_blob(conn, evidence_id))
    }

    /// Metadata of every blob attached to a result
    pub fn for_result(&self, result_id: &str) -> Result<Vec<EvidenceBlob>, StoreError> {
        self.store.with_conn(|conn| evidence::blobs_for_result(conn, result_id))
    }
}

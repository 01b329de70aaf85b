//! Remote collaborators
//!
//! The engine talks to the system of record only through these traits:
//!
//! - [`ResultApi`] / [`ChecklistApi`] - structured writes
//! - [`ObjectStorage`] - evidence binaries
//! - [`ReadApi`] - project bundles for hydration
//! - [`ReachabilityProbe`] - cheap "can we talk to it" check
//!
//! Every write carries the mutation's idempotency key so the remote side
//! can collapse replays.

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::RemoteError;
use crate::model::{
    AuditResultMirror, ChecklistMirror, PhotoRef, ProjectMirror, QuantitativeFields, ResultStatus,
};
use crate::sync::mutation::ChecklistPatch;

pub use http::HttpRemote;

/// Body of a result update; absent fields are left untouched remotely
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ResultStatus>,
    /// `Some(None)` clears the comment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<Option<String>>,
    /// Public URLs only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photos: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantitative: Option<QuantitativeFields>,
}

impl ResultUpdate {
    /// Update touching only the photo list
    pub fn photos_only(photos: Vec<String>) -> Self {
        Self {
            photos: Some(photos),
            ..Default::default()
        }
    }
}

/// Remote acknowledgement of a write
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    #[serde(default)]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadedObject {
    pub public_url: String,
}

/// Audit result as the remote store returns it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteResult {
    pub id: String,
    pub checklist_id: String,
    pub requirement_id: String,
    pub status: ResultStatus,
    #[serde(default)]
    pub comment: Option<String>,
    /// Public URLs
    #[serde(default)]
    pub photos: Vec<String>,
    #[serde(default)]
    pub requirement_content: Option<String>,
    #[serde(default)]
    pub requirement_clause: Option<String>,
    #[serde(default)]
    pub quantitative: Option<QuantitativeFields>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl RemoteResult {
    /// Mirror with remote photos only; local refs are merged by hydration
    pub fn into_mirror(self) -> AuditResultMirror {
        AuditResultMirror {
            id: self.id,
            checklist_id: self.checklist_id,
            requirement_id: self.requirement_id,
            status: self.status,
            comment: self.comment,
            photos: self
                .photos
                .into_iter()
                .map(|url| PhotoRef::Remote { url, evidence_id: None })
                .collect(),
            requirement_content: self.requirement_content,
            requirement_clause: self.requirement_clause,
            quantitative: self.quantitative,
            updated_at: self.updated_at,
            stale: false,
            dirty: false,
        }
    }
}

/// One project with its checklists and results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectBundle {
    pub project: ProjectMirror,
    #[serde(default)]
    pub checklists: Vec<ChecklistMirror>,
    #[serde(default)]
    pub results: Vec<RemoteResult>,
}

#[async_trait]
pub trait ResultApi: Send + Sync {
    async fn update_result(
        &self,
        result_id: &str,
        update: &ResultUpdate,
        idempotency_key: &str,
    ) -> Result<Ack, RemoteError>;
}

#[async_trait]
pub trait ChecklistApi: Send + Sync {
    async fn update_checklist(
        &self,
        checklist_id: &str,
        patch: &ChecklistPatch,
        idempotency_key: &str,
    ) -> Result<Ack, RemoteError>;
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Upload (or overwrite) the object at `path`
    async fn upload(
        &self,
        path: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<UploadedObject, RemoteError>;
}

#[async_trait]
pub trait ReadApi: Send + Sync {
    async fn get_project_bundle(&self, project_id: &str) -> Result<ProjectBundle, RemoteError>;
}

#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// True when the remote API answers
    async fn probe(&self) -> bool;
}

/// The set of remote collaborators the engine needs
#[derive(Clone)]
pub struct Remote {
    pub results: Arc<dyn ResultApi>,
    pub checklists: Arc<dyn ChecklistApi>,
    pub storage: Arc<dyn ObjectStorage>,
    pub reader: Arc<dyn ReadApi>,
}

impl Remote {
    /// Use one backend for every role
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: ResultApi + ChecklistApi + ObjectStorage + ReadApi + 'static,
    {
        Self {
            results: backend.clone(),
            checklists: backend.clone(),
            storage: backend.clone(),
            reader: backend,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_photos_only_update_omits_other_fields() {
        let update = ResultUpdate::photos_only(vec!["https://cdn/a.jpg".into()]);
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json, serde_json::json!({ "photos": ["https://cdn/a.jpg"] }));
    }

    #[test]
    fn test_cleared_comment_serializes_as_null() {
        let update = ResultUpdate {
            status: Some(ResultStatus::Ok),
            comment: Some(None),
            ..Default::default()
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["status"], "OK");
        assert!(json["comment"].is_null());
        assert!(json.get("photos").is_none());
    }

    #[test]
    fn test_remote_result_into_mirror() {
        let remote: RemoteResult = serde_json::from_value(serde_json::json!({
            "id": "r1",
            "checklist_id": "c1",
            "requirement_id": "req-1",
            "status": "VIOLATION",
            "photos": ["https://cdn/a.jpg"]
        }))
        .unwrap();
        let mirror = remote.into_mirror();
        assert_eq!(mirror.status, ResultStatus::Defect);
        assert_eq!(mirror.photos[0].url(), Some("https://cdn/a.jpg"));
        assert!(!mirror.dirty);
    }
}

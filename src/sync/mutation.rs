//! Queued mutation records

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::model::{PhotoRef, QuantitativeFields, ResultStatus};

/// Row id of a queued mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MutationId(pub i64);

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationType {
    UpdateResult,
    UpdateChecklist,
    UploadImage,
}

impl MutationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationType::UpdateResult => "UPDATE_RESULT",
            MutationType::UpdateChecklist => "UPDATE_CHECKLIST",
            MutationType::UploadImage => "UPLOAD_IMAGE",
        }
    }

    /// Uploads run in their own concurrency lane
    pub fn is_upload(&self) -> bool {
        matches!(self, MutationType::UploadImage)
    }
}

impl FromStr for MutationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UPDATE_RESULT" => Ok(MutationType::UpdateResult),
            "UPDATE_CHECKLIST" => Ok(MutationType::UpdateChecklist),
            "UPLOAD_IMAGE" => Ok(MutationType::UploadImage),
            other => Err(format!("unknown mutation type: {}", other)),
        }
    }
}

/// Lifecycle of a queued mutation.
///
/// `Failed` is a pending mutation waiting out its backoff window after a
/// transient failure; it dispatches like `Pending` once the window elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationStatus {
    Pending,
    InFlight,
    Failed,
    Dead,
}

impl MutationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationStatus::Pending => "PENDING",
            MutationStatus::InFlight => "IN_FLIGHT",
            MutationStatus::Failed => "FAILED",
            MutationStatus::Dead => "DEAD",
        }
    }

    /// Still owed to the remote store
    pub fn is_unsettled(&self) -> bool {
        !matches!(self, MutationStatus::Dead)
    }
}

impl FromStr for MutationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(MutationStatus::Pending),
            "IN_FLIGHT" => Ok(MutationStatus::InFlight),
            "FAILED" => Ok(MutationStatus::Failed),
            "DEAD" => Ok(MutationStatus::Dead),
            other => Err(format!("unknown mutation status: {}", other)),
        }
    }
}

/// Why a mutation stopped being retried automatically
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadReason {
    /// Remote rejected the payload shape or a business rule
    Validation,
    /// Remote record was deleted or changed incompatibly
    Conflict,
    /// Transient failures exceeded the attempt cap
    RetriesExhausted,
    /// The evidence binary to upload is gone from the local store
    MissingBlob,
}

impl DeadReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadReason::Validation => "validation",
            DeadReason::Conflict => "conflict",
            DeadReason::RetriesExhausted => "retries_exhausted",
            DeadReason::MissingBlob => "missing_blob",
        }
    }
}

impl FromStr for DeadReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "validation" => Ok(DeadReason::Validation),
            "conflict" => Ok(DeadReason::Conflict),
            "retries_exhausted" => Ok(DeadReason::RetriesExhausted),
            "missing_blob" => Ok(DeadReason::MissingBlob),
            other => Err(format!("unknown dead reason: {}", other)),
        }
    }
}

/// Editable fields of an audit result at the time of the local write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultPatch {
    pub status: ResultStatus,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub photos: Vec<PhotoRef>,
    #[serde(default)]
    pub quantitative: Option<QuantitativeFields>,
}

/// Checklist fields changed locally; absent fields are left untouched remotely
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChecklistPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_name: Option<String>,
}

impl ChecklistPatch {
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.name.is_none() && self.system_name.is_none()
    }
}

/// Upload job for a captured evidence blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadImage {
    pub result_id: String,
    pub project_id: String,
    /// Object storage path
    pub path: String,
    pub content_type: String,
}

/// Payload of a queued mutation; the variant determines its type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationPayload {
    UpdateResult(ResultPatch),
    UpdateChecklist(ChecklistPatch),
    UploadImage(UploadImage),
}

impl MutationPayload {
    pub fn mutation_type(&self) -> MutationType {
        match self {
            MutationPayload::UpdateResult(_) => MutationType::UpdateResult,
            MutationPayload::UpdateChecklist(_) => MutationType::UpdateChecklist,
            MutationPayload::UploadImage(_) => MutationType::UploadImage,
        }
    }
}

/// A queued, not yet acknowledged change to a remote entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub id: MutationId,
    pub mutation_type: MutationType,
    pub target_id: String,
    pub payload: MutationPayload,
    /// Enqueue time in Unix millis; strictly increasing per store
    pub enqueued_at: i64,
    pub attempts: u32,
    pub status: MutationStatus,
    /// Earliest dispatch time in Unix millis
    pub next_attempt_at: i64,
    pub last_error: Option<String>,
    pub dead_reason: Option<DeadReason>,
}

impl Mutation {
    /// Stable key sent with every remote call for this mutation
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.target_id, self.enqueued_at)
    }
}

/// Mutation counts per status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: u64,
    pub in_flight: u64,
    pub failed: u64,
    pub dead: u64,
}

impl QueueCounts {
    pub fn unsettled(&self) -> u64 {
        self.pending + self.in_flight + self.failed
    }
}

//! Domain records mirrored from the system of record
//!
//! Mirrors carry two local-only flags:
//! - `stale`: the remote reported the record gone or conflicting
//! - `dirty`: a local write whose queue entry has not been written yet

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Outcome recorded for a single requirement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultStatus {
    NotChecked,
    Ok,
    #[serde(alias = "VIOLATION")]
    Defect,
    Warning,
    Na,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::NotChecked => "NOT_CHECKED",
            ResultStatus::Ok => "OK",
            ResultStatus::Defect => "DEFECT",
            ResultStatus::Warning => "WARNING",
            ResultStatus::Na => "NA",
        }
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResultStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NOT_CHECKED" => Ok(ResultStatus::NotChecked),
            "OK" => Ok(ResultStatus::Ok),
            "DEFECT" | "VIOLATION" => Ok(ResultStatus::Defect),
            "WARNING" => Ok(ResultStatus::Warning),
            "NA" => Ok(ResultStatus::Na),
            other => Err(format!("unknown result status: {}", other)),
        }
    }
}

/// How a multi-instance requirement was inspected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InspectionMethod {
    Full,
    Sample,
    Visual,
}

/// A single failing instance found during a multi-instance inspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Defect {
    /// Where the failing instance is (e.g. "Floor 2, room 204")
    pub location: String,
    #[serde(default)]
    pub note: Option<String>,
}

/// Quantitative sub-fields for multi-instance requirements.
///
/// `failing_count` is derived from `defects` and recomputed before every
/// dispatch; a value set independently is never trusted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantitativeFields {
    #[serde(default)]
    pub inspected_count: Option<u32>,
    #[serde(default)]
    pub failing_count: u32,
    #[serde(default)]
    pub inspection_method: Option<InspectionMethod>,
    #[serde(default)]
    pub defects: Vec<Defect>,
}

impl QuantitativeFields {
    /// Recompute the failing count from the authoritative defect list
    pub fn recomputed(mut self) -> Self {
        self.failing_count = self.defects.len() as u32;
        self
    }
}

/// Reference from a result to one piece of photographic evidence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PhotoRef {
    /// Captured on this device, not uploaded yet
    Local { evidence_id: String },
    /// Addressable remotely; `evidence_id` is kept when the binary is also local
    Remote {
        url: String,
        #[serde(default)]
        evidence_id: Option<String>,
    },
}

impl PhotoRef {
    pub fn evidence_id(&self) -> Option<&str> {
        match self {
            PhotoRef::Local { evidence_id } => Some(evidence_id),
            PhotoRef::Remote { evidence_id, .. } => evidence_id.as_deref(),
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            PhotoRef::Local { .. } => None,
            PhotoRef::Remote { url, .. } => Some(url),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectMirror {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
    pub status: String,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecklistMirror {
    pub id: String,
    pub project_id: String,
    #[serde(default)]
    pub requirement_set_id: Option<String>,
    pub status: String,
    pub name: String,
    #[serde(default)]
    pub system_name: Option<String>,
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub stale: bool,
    #[serde(default)]
    pub dirty: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditResultMirror {
    pub id: String,
    pub checklist_id: String,
    pub requirement_id: String,
    pub status: ResultStatus,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub photos: Vec<PhotoRef>,
    #[serde(default)]
    pub requirement_content: Option<String>,
    #[serde(default)]
    pub requirement_clause: Option<String>,
    #[serde(default)]
    pub quantitative: Option<QuantitativeFields>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub stale: bool,
    #[serde(default)]
    pub dirty: bool,
}

/// Logical table of mirrored entities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Projects,
    Checklists,
    AuditResults,
}

impl Collection {
    pub fn table(&self) -> &'static str {
        match self {
            Collection::Projects => "projects",
            Collection::Checklists => "checklists",
            Collection::AuditResults => "audit_results",
        }
    }
}

/// A local copy of a remote record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "collection", content = "entity", rename_all = "snake_case")]
pub enum EntityMirror {
    Project(ProjectMirror),
    Checklist(ChecklistMirror),
    AuditResult(AuditResultMirror),
}

impl EntityMirror {
    pub fn id(&self) -> &str {
        match self {
            EntityMirror::Project(p) => &p.id,
            EntityMirror::Checklist(c) => &c.id,
            EntityMirror::AuditResult(r) => &r.id,
        }
    }

    pub fn collection(&self) -> Collection {
        match self {
            EntityMirror::Project(_) => Collection::Projects,
            EntityMirror::Checklist(_) => Collection::Checklists,
            EntityMirror::AuditResult(_) => Collection::AuditResults,
        }
    }

    pub fn is_stale(&self) -> bool {
        match self {
            EntityMirror::Project(p) => p.stale,
            EntityMirror::Checklist(c) => c.stale,
            EntityMirror::AuditResult(r) => r.stale,
        }
    }
}

/// Where a capture was taken
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// Provenance recorded alongside a captured photo
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    /// Capture time (RFC 3339)
    pub captured_at: String,
    #[serde(default)]
    pub geolocation: Option<GeoPoint>,
    #[serde(default)]
    pub requirement_clause: Option<String>,
    #[serde(default)]
    pub project_name: Option<String>,
}

impl Provenance {
    /// One-line caption suitable for rendering under the photo
    pub fn caption(&self) -> String {
        let mut parts = vec![self.captured_at.clone()];
        if let Some(geo) = &self.geolocation {
            parts.push(format!("{:.5},{:.5}", geo.latitude, geo.longitude));
        }
        if let Some(clause) = &self.requirement_clause {
            parts.push(clause.clone());
        }
        if let Some(name) = &self.project_name {
            parts.push(name.clone());
        }
        parts.join(" | ")
    }
}

/// A locally held evidence binary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceBlob {
    pub id: String,
    pub result_id: String,
    pub project_id: String,
    #[serde(skip)]
    pub binary: Vec<u8>,
    pub content_type: String,
    pub content_hash: String,
    pub byte_size: u64,
    pub uploaded: bool,
    #[serde(default)]
    pub public_url: Option<String>,
    #[serde(default)]
    pub provenance: Option<Provenance>,
    pub created_at: String,
}

/// Handle returned to the caller after a capture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRef {
    pub evidence_id: String,
    pub result_id: String,
    #[serde(default)]
    pub public_url: Option<String>,
}

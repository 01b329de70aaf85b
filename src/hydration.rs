//! Hydration - pull a project's remote records into the local store
//!
//! Remote data never overwrites local work. A mirror with a dirty flag or
//! any queued mutation, dead ones included until an operator retries or
//! discards them, is left as is; locally captured photos
//! not yet uploaded survive a refresh of their result; records deleted
//! remotely are removed only when nothing local depends on them, and
//! flagged stale otherwise.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{HydrationError, RemoteError, StoreError};
use crate::model::{AuditResultMirror, ChecklistMirror, Collection, PhotoRef};
use crate::remote::{ProjectBundle, ReadApi};
use crate::storage::{entities, evidence, queue, LocalStore};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HydrationStats {
    pub checklists: usize,
    pub results: usize,
    /// Mirrors left untouched because of pending local work
    pub skipped: usize,
    /// Local records deleted because the remote no longer has them
    pub removed: usize,
    /// Local records the remote dropped but that still hold local work
    pub flagged_stale: usize,
}

pub struct Hydrator {
    store: Arc<LocalStore>,
    reader: Arc<dyn ReadApi>,
    timeout: Duration,
}

impl Hydrator {
    pub fn new(store: Arc<LocalStore>, reader: Arc<dyn ReadApi>, timeout: Duration) -> Self {
        Self { store, reader, timeout }
    }

    /// Fetch the project bundle and merge it into the store in one transaction
    pub async fn hydrate_project(&self, project_id: &str) -> Result<HydrationStats, HydrationError> {
        info!(project = %project_id, "Hydrating project");

        let fetched = tokio::time::timeout(self.timeout, self.reader.get_project_bundle(project_id))
            .await
            .unwrap_or(Err(RemoteError::Timeout));

        let bundle = match fetched {
            Ok(bundle) => bundle,
            Err(RemoteError::NotFound(_)) => {
                self.store.flag_stale(Collection::Projects, project_id)?;
                warn!(project = %project_id, "Project no longer exists remotely");
                return Err(HydrationError::NotFound(project_id.to_string()));
            }
            Err(e) => {
                warn!(project = %project_id, "Hydration fetch failed: {}", e);
                return Err(e.into());
            }
        };

        let stats = self.store.with_tx(|tx| apply_bundle(tx, project_id, bundle))?;
        info!(
            project = %project_id,
            checklists = stats.checklists,
            results = stats.results,
            skipped = stats.skipped,
            removed = stats.removed,
            flagged_stale = stats.flagged_stale,
            "Hydration complete"
        );
        Ok(stats)
    }
}

fn checklist_has_local_work(conn: &Connection, checklist: &ChecklistMirror) -> Result<bool, StoreError> {
    Ok(checklist.dirty || queue::has_any(conn, &checklist.id)?)
}

fn result_has_local_work(conn: &Connection, result: &AuditResultMirror) -> Result<bool, StoreError> {
    Ok(result.dirty
        || queue::has_any(conn, &result.id)?
        || evidence::has_pending_for_result(conn, &result.id)?)
}

/// Remote photo list plus local refs the remote cannot know about yet
fn merge_photos(
    conn: &Connection,
    remote: Vec<PhotoRef>,
    local: &[PhotoRef],
) -> Result<Vec<PhotoRef>, StoreError> {
    let remote_urls: HashSet<String> = remote.iter().filter_map(|p| p.url()).map(String::from).collect();

    let mut merged: Vec<PhotoRef> = remote
        .into_iter()
        .map(|photo| match photo {
            PhotoRef::Remote { url, evidence_id: None } => {
                let evidence_id = local
                    .iter()
                    .find(|l| l.url() == Some(url.as_str()))
                    .and_then(|l| l.evidence_id())
                    .map(String::from);
                PhotoRef::Remote { url, evidence_id }
            }
            other => other,
        })
        .collect();

    for photo in local {
        let keep = match photo {
            PhotoRef::Local { .. } => true,
            // Uploaded but not linked remotely yet
            PhotoRef::Remote { url, evidence_id: Some(id) } if !remote_urls.contains(url) => {
                queue::has_unsettled(conn, id)?
            }
            PhotoRef::Remote { .. } => false,
        };
        if keep {
            merged.push(photo.clone());
        }
    }
    Ok(merged)
}

fn apply_bundle(
    conn: &Connection,
    project_id: &str,
    bundle: ProjectBundle,
) -> Result<HydrationStats, StoreError> {
    let mut stats = HydrationStats::default();

    let mut project = bundle.project;
    project.stale = false;
    entities::put_project(conn, &project)?;

    let remote_checklists: HashSet<String> = bundle.checklists.iter().map(|c| c.id.clone()).collect();
    let remote_results: HashSet<String> = bundle.results.iter().map(|r| r.id.clone()).collect();

    for mut checklist in bundle.checklists {
        if let Some(local) = entities::get_checklist(conn, &checklist.id)? {
            if checklist_has_local_work(conn, &local)? {
                debug!(checklist = %checklist.id, "Skipping checklist with pending work");
                stats.skipped += 1;
                continue;
            }
        }
        checklist.stale = false;
        checklist.dirty = false;
        entities::put_checklist(conn, &checklist)?;
        stats.checklists += 1;
    }

    for remote in bundle.results {
        let local = entities::get_result(conn, &remote.id)?;
        if let Some(local) = &local {
            if local.dirty || queue::has_any(conn, &local.id)? {
                debug!(result = %local.id, "Skipping result with pending work");
                stats.skipped += 1;
                continue;
            }
        }

        let mut mirror = remote.into_mirror();
        if let Some(local) = local {
            mirror.photos = merge_photos(conn, mirror.photos, &local.photos)?;
        }
        entities::put_result(conn, &mirror)?;
        stats.results += 1;
    }

    // Records the remote no longer returns
    for checklist in entities::checklists_for_project(conn, project_id)? {
        let mut kept_results = 0;
        for result in entities::results_for_checklist(conn, &checklist.id)? {
            if remote_results.contains(&result.id) {
                kept_results += 1;
                continue;
            }
            if result_has_local_work(conn, &result)? {
                entities::set_stale(conn, Collection::AuditResults, &result.id, true)?;
                stats.flagged_stale += 1;
                kept_results += 1;
            } else {
                entities::delete_entity(conn, Collection::AuditResults, &result.id)?;
                evidence::delete_uploaded_for_result(conn, &result.id)?;
                stats.removed += 1;
            }
        }

        if remote_checklists.contains(&checklist.id) {
            continue;
        }
        if kept_results > 0 || checklist_has_local_work(conn, &checklist)? {
            entities::set_stale(conn, Collection::Checklists, &checklist.id, true)?;
            stats.flagged_stale += 1;
        } else {
            entities::delete_entity(conn, Collection::Checklists, &checklist.id)?;
            stats.removed += 1;
        }
    }

    Ok(stats)
}

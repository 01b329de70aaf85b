//! Mirror CRUD operations for projects, checklists and audit results

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use std::collections::VecDeque;

use super::LocalStore;
use crate::error::StoreError;
use crate::model::{
    AuditResultMirror, ChecklistMirror, Collection, EntityMirror, ProjectMirror, ResultStatus,
};

/// Rows fetched per cursor page
pub const DEFAULT_PAGE_SIZE: usize = 200;

fn conversion_error<E>(e: E) -> rusqlite::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    rusqlite::Error::FromSqlConversionFailure(0, Type::Text, e.into())
}

fn json_column<T: DeserializeOwned>(row: &Row, column: &str) -> Result<T, rusqlite::Error> {
    let raw: String = row.get(column)?;
    serde_json::from_str(&raw).map_err(conversion_error)
}

fn optional_json_column<T: DeserializeOwned>(
    row: &Row,
    column: &str,
) -> Result<Option<T>, rusqlite::Error> {
    let raw: Option<String> = row.get(column)?;
    raw.map(|s| serde_json::from_str(&s).map_err(conversion_error))
        .transpose()
}

fn project_from_row(row: &Row) -> Result<ProjectMirror, rusqlite::Error> {
    Ok(ProjectMirror {
        id: row.get("id")?,
        name: row.get("name")?,
        address: row.get("address")?,
        status: row.get("status")?,
        updated_at: row.get("updated_at")?,
        stale: row.get("stale")?,
    })
}

fn checklist_from_row(row: &Row) -> Result<ChecklistMirror, rusqlite::Error> {
    Ok(ChecklistMirror {
        id: row.get("id")?,
        project_id: row.get("project_id")?,
        requirement_set_id: row.get("requirement_set_id")?,
        status: row.get("status")?,
        name: row.get("name")?,
        system_name: row.get("system_name")?,
        project_name: row.get("project_name")?,
        updated_at: row.get("updated_at")?,
        stale: row.get("stale")?,
        dirty: row.get("dirty")?,
    })
}

fn result_from_row(row: &Row) -> Result<AuditResultMirror, rusqlite::Error> {
    let status: String = row.get("status")?;
    Ok(AuditResultMirror {
        id: row.get("id")?,
        checklist_id: row.get("checklist_id")?,
        requirement_id: row.get("requirement_id")?,
        status: status.parse::<ResultStatus>().map_err(conversion_error)?,
        comment: row.get("comment")?,
        photos: json_column(row, "photos")?,
        requirement_content: row.get("requirement_content")?,
        requirement_clause: row.get("requirement_clause")?,
        quantitative: optional_json_column(row, "quantitative")?,
        updated_at: row.get("updated_at")?,
        stale: row.get("stale")?,
        dirty: row.get("dirty")?,
    })
}

fn entity_from_row(collection: Collection, row: &Row) -> Result<EntityMirror, rusqlite::Error> {
    Ok(match collection {
        Collection::Projects => EntityMirror::Project(project_from_row(row)?),
        Collection::Checklists => EntityMirror::Checklist(checklist_from_row(row)?),
        Collection::AuditResults => EntityMirror::AuditResult(result_from_row(row)?),
    })
}

pub fn get_project(conn: &Connection, id: &str) -> Result<Option<ProjectMirror>, StoreError> {
    Ok(conn
        .query_row("SELECT * FROM projects WHERE id = ?1", params![id], project_from_row)
        .optional()?)
}

pub fn get_checklist(conn: &Connection, id: &str) -> Result<Option<ChecklistMirror>, StoreError> {
    Ok(conn
        .query_row("SELECT * FROM checklists WHERE id = ?1", params![id], checklist_from_row)
        .optional()?)
}

pub fn get_result(conn: &Connection, id: &str) -> Result<Option<AuditResultMirror>, StoreError> {
    Ok(conn
        .query_row("SELECT * FROM audit_results WHERE id = ?1", params![id], result_from_row)
        .optional()?)
}

pub fn put_project(conn: &Connection, project: &ProjectMirror) -> Result<(), StoreError> {
    conn.execute(
        r#"
        INSERT INTO projects (id, name, address, status, updated_at, stale)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            address = excluded.address,
            status = excluded.status,
            updated_at = excluded.updated_at,
            stale = excluded.stale
        "#,
        params![
            project.id,
            project.name,
            project.address,
            project.status,
            project.updated_at,
            project.stale,
        ],
    )?;
    Ok(())
}

pub fn put_checklist(conn: &Connection, checklist: &ChecklistMirror) -> Result<(), StoreError> {
    conn.execute(
        r#"
        INSERT INTO checklists (id, project_id, requirement_set_id, status, name, system_name,
                                project_name, updated_at, stale, dirty)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(id) DO UPDATE SET
            project_id = excluded.project_id,
            requirement_set_id = excluded.requirement_set_id,
            status = excluded.status,
            name = excluded.name,
            system_name = excluded.system_name,
            project_name = excluded.project_name,
            updated_at = excluded.updated_at,
            stale = excluded.stale,
            dirty = excluded.dirty
        "#,
        params![
            checklist.id,
            checklist.project_id,
            checklist.requirement_set_id,
            checklist.status,
            checklist.name,
            checklist.system_name,
            checklist.project_name,
            checklist.updated_at,
            checklist.stale,
            checklist.dirty,
        ],
    )?;
    Ok(())
}

pub fn put_result(conn: &Connection, result: &AuditResultMirror) -> Result<(), StoreError> {
    let photos = serde_json::to_string(&result.photos)?;
    let quantitative = result
        .quantitative
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        r#"
        INSERT INTO audit_results (id, checklist_id, requirement_id, status, comment, photos,
                                   requirement_content, requirement_clause, quantitative,
                                   updated_at, stale, dirty)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        ON CONFLICT(id) DO UPDATE SET
            checklist_id = excluded.checklist_id,
            requirement_id = excluded.requirement_id,
            status = excluded.status,
            comment = excluded.comment,
            photos = excluded.photos,
            requirement_content = excluded.requirement_content,
            requirement_clause = excluded.requirement_clause,
            quantitative = excluded.quantitative,
            updated_at = excluded.updated_at,
            stale = excluded.stale,
            dirty = excluded.dirty
        "#,
        params![
            result.id,
            result.checklist_id,
            result.requirement_id,
            result.status.as_str(),
            result.comment,
            photos,
            result.requirement_content,
            result.requirement_clause,
            quantitative,
            result.updated_at,
            result.stale,
            result.dirty,
        ],
    )?;
    Ok(())
}

pub fn get_entity(
    conn: &Connection,
    collection: Collection,
    id: &str,
) -> Result<Option<EntityMirror>, StoreError> {
    let sql = format!("SELECT * FROM {} WHERE id = ?1", collection.table());
    Ok(conn
        .query_row(&sql, params![id], |row| entity_from_row(collection, row))
        .optional()?)
}

pub fn put_entity(conn: &Connection, entity: &EntityMirror) -> Result<(), StoreError> {
    match entity {
        EntityMirror::Project(p) => put_project(conn, p),
        EntityMirror::Checklist(c) => put_checklist(conn, c),
        EntityMirror::AuditResult(r) => put_result(conn, r),
    }
}

/// Delete a mirror; returns whether a row existed
pub fn delete_entity(conn: &Connection, collection: Collection, id: &str) -> Result<bool, StoreError> {
    let sql = format!("DELETE FROM {} WHERE id = ?1", collection.table());
    Ok(conn.execute(&sql, params![id])? > 0)
}

/// Flag (or clear) the stale marker; returns whether a row existed
pub fn set_stale(
    conn: &Connection,
    collection: Collection,
    id: &str,
    stale: bool,
) -> Result<bool, StoreError> {
    let sql = format!("UPDATE {} SET stale = ?2 WHERE id = ?1", collection.table());
    Ok(conn.execute(&sql, params![id, stale])? > 0)
}

/// Projects carry no dirty flag; only checklists and results do.
pub fn set_dirty(
    conn: &Connection,
    collection: Collection,
    id: &str,
    dirty: bool,
) -> Result<bool, StoreError> {
    if collection == Collection::Projects {
        return Ok(false);
    }
    let sql = format!("UPDATE {} SET dirty = ?2 WHERE id = ?1", collection.table());
    Ok(conn.execute(&sql, params![id, dirty])? > 0)
}

/// Record the remote's modification time after an acknowledged write
pub fn set_updated_at(
    conn: &Connection,
    collection: Collection,
    id: &str,
    updated_at: &str,
) -> Result<bool, StoreError> {
    let sql = format!("UPDATE {} SET updated_at = ?2 WHERE id = ?1", collection.table());
    Ok(conn.execute(&sql, params![id, updated_at])? > 0)
}

/// One keyset page of a collection, ordered by id
pub fn page(
    conn: &Connection,
    collection: Collection,
    after: Option<&str>,
    limit: usize,
) -> Result<Vec<EntityMirror>, StoreError> {
    let sql = format!(
        "SELECT * FROM {} WHERE (?1 IS NULL OR id > ?1) ORDER BY id LIMIT ?2",
        collection.table()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![after, limit as i64], |row| entity_from_row(collection, row))?;
    rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
}

pub fn checklists_for_project(
    conn: &Connection,
    project_id: &str,
) -> Result<Vec<ChecklistMirror>, StoreError> {
    let mut stmt = conn.prepare("SELECT * FROM checklists WHERE project_id = ?1 ORDER BY id")?;
    let rows = stmt.query_map(params![project_id], checklist_from_row)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
}

pub fn results_for_checklist(
    conn: &Connection,
    checklist_id: &str,
) -> Result<Vec<AuditResultMirror>, StoreError> {
    let mut stmt = conn.prepare("SELECT * FROM audit_results WHERE checklist_id = ?1 ORDER BY id")?;
    let rows = stmt.query_map(params![checklist_id], result_from_row)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
}

pub fn dirty_results(conn: &Connection) -> Result<Vec<AuditResultMirror>, StoreError> {
    let mut stmt = conn.prepare("SELECT * FROM audit_results WHERE dirty = 1 ORDER BY id")?;
    let rows = stmt.query_map([], result_from_row)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
}

pub fn dirty_checklists(conn: &Connection) -> Result<Vec<ChecklistMirror>, StoreError> {
    let mut stmt = conn.prepare("SELECT * FROM checklists WHERE dirty = 1 ORDER BY id")?;
    let rows = stmt.query_map([], checklist_from_row)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
}

/// Lazy, restartable scan over one collection.
///
/// Rows are pulled one page at a time using the last seen id as the key,
/// so writes between pages never make the cursor repeat or skip a row that
/// existed when the scan started.
pub struct EntityCursor<'a, P> {
    store: &'a LocalStore,
    collection: Collection,
    predicate: P,
    page_size: usize,
    last_id: Option<String>,
    buffer: VecDeque<EntityMirror>,
    exhausted: bool,
}

impl<'a, P> EntityCursor<'a, P>
where
    P: FnMut(&EntityMirror) -> bool,
{
    pub(super) fn new(store: &'a LocalStore, collection: Collection, predicate: P) -> Self {
        Self {
            store,
            collection,
            predicate,
            page_size: DEFAULT_PAGE_SIZE,
            last_id: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Start the scan over from the first row
    pub fn rewind(&mut self) {
        self.last_id = None;
        self.buffer.clear();
        self.exhausted = false;
    }

    fn fill(&mut self) -> Result<(), StoreError> {
        let collection = self.collection;
        let page_size = self.page_size;
        let after = self.last_id.clone();
        let rows = self
            .store
            .with_conn(|conn| page(conn, collection, after.as_deref(), page_size))?;

        if rows.len() < page_size {
            self.exhausted = true;
        }
        if let Some(last) = rows.last() {
            self.last_id = Some(last.id().to_string());
        }
        self.buffer
            .extend(rows.into_iter().filter(|e| (self.predicate)(e)));
        Ok(())
    }
}

impl<'a, P> Iterator for EntityCursor<'a, P>
where
    P: FnMut(&EntityMirror) -> bool,
{
    type Item = Result<EntityMirror, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entity) = self.buffer.pop_front() {
                return Some(Ok(entity));
            }
            if self.exhausted {
                return None;
            }
            if let Err(e) = self.fill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
    }
}

//! Local durable store
//!
//! One SQLite database holds everything the device must not lose:
//!
//! - `projects`, `checklists`, `audit_results` - mirrors of remote records
//! - `images` - captured evidence binaries and their upload state
//! - `sync_queue` - mutations not yet acknowledged by the remote store
//!
//! The database runs with `synchronous=FULL`, so a committed write survives
//! power loss. Anything that must be atomic (a local write together with
//! its queue entry, a capture together with its upload job) goes through
//! [`LocalStore::with_tx`].

pub mod entities;
pub mod evidence;
pub mod queue;
pub mod schema;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, Transaction};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::model::{AuditResultMirror, ChecklistMirror, Collection, EntityMirror, ProjectMirror};

pub use entities::EntityCursor;
pub use queue::Lane;

/// File name of the database inside the data directory
pub const DATABASE_FILE: &str = "inspection.db";

/// SQLite-backed local store
pub struct LocalStore {
    conn: Mutex<Connection>,
}

impl LocalStore {
    /// Open or create the store inside `data_dir`
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join(DATABASE_FILE);
        info!("Opening local store at {:?}", db_path);

        let conn = Connection::open(&db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.with_conn(schema::init_schema)?;
        Ok(store)
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        debug!("Opening in-memory local store");
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.with_conn(schema::init_schema)?;
        Ok(store)
    }

    /// Run a read or single-statement write
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Run `f` inside one transaction; nothing is kept if it returns an error
    pub fn with_tx<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T, StoreError>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Internal(format!("Lock poisoned: {}", e)))?;
        let mut tx = conn.transaction()?;
        let out = f(&mut tx)?;
        tx.commit()?;
        Ok(out)
    }

    pub fn get(&self, collection: Collection, id: &str) -> Result<Option<EntityMirror>, StoreError> {
        self.with_conn(|conn| entities::get_entity(conn, collection, id))
    }

    /// Atomic upsert of one mirror
    pub fn put(&self, entity: &EntityMirror) -> Result<(), StoreError> {
        self.with_conn(|conn| entities::put_entity(conn, entity))
    }

    pub fn delete(&self, collection: Collection, id: &str) -> Result<bool, StoreError> {
        self.with_conn(|conn| entities::delete_entity(conn, collection, id))
    }

    /// Lazy scan of a collection, yielding mirrors that match `predicate`
    pub fn query<P>(&self, collection: Collection, predicate: P) -> EntityCursor<'_, P>
    where
        P: FnMut(&EntityMirror) -> bool,
    {
        EntityCursor::new(self, collection, predicate)
    }

    pub fn get_project(&self, id: &str) -> Result<Option<ProjectMirror>, StoreError> {
        self.with_conn(|conn| entities::get_project(conn, id))
    }

    pub fn get_checklist(&self, id: &str) -> Result<Option<ChecklistMirror>, StoreError> {
        self.with_conn(|conn| entities::get_checklist(conn, id))
    }

    pub fn get_result(&self, id: &str) -> Result<Option<AuditResultMirror>, StoreError> {
        self.with_conn(|conn| entities::get_result(conn, id))
    }

    pub fn checklists_for_project(&self, project_id: &str) -> Result<Vec<ChecklistMirror>, StoreError> {
        self.with_conn(|conn| entities::checklists_for_project(conn, project_id))
    }

    pub fn results_for_checklist(&self, checklist_id: &str) -> Result<Vec<AuditResultMirror>, StoreError> {
        self.with_conn(|conn| entities::results_for_checklist(conn, checklist_id))
    }

    /// Mark a mirror as stale; missing rows are ignored
    pub fn flag_stale(&self, collection: Collection, id: &str) -> Result<bool, StoreError> {
        self.with_conn(|conn| entities::set_stale(conn, collection, id, true))
    }

    /// Bytes currently held by evidence binaries
    pub fn evidence_bytes(&self) -> Result<u64, StoreError> {
        self.with_conn(evidence::total_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn checklist(id: &str) -> ChecklistMirror {
        ChecklistMirror {
            id: id.to_string(),
            project_id: "p1".into(),
            requirement_set_id: None,
            status: "IN_PROGRESS".into(),
            name: "Fire safety".into(),
            system_name: None,
            project_name: Some("Depot".into()),
            updated_at: None,
            stale: false,
            dirty: false,
        }
    }

    #[test]
    fn test_data_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = LocalStore::open(dir.path()).unwrap();
            store.put(&EntityMirror::Checklist(checklist("c1"))).unwrap();
        }
        let store = LocalStore::open(dir.path()).unwrap();
        let loaded = store.get_checklist("c1").unwrap().unwrap();
        assert_eq!(loaded.name, "Fire safety");
    }

    #[test]
    fn test_failed_transaction_keeps_nothing() {
        let store = LocalStore::open_in_memory().unwrap();
        let result = store.with_tx(|tx| {
            entities::put_checklist(tx, &checklist("c1"))?;
            Err::<(), _>(StoreError::Internal("abort".into()))
        });
        assert!(result.is_err());
        assert!(store.get(Collection::Checklists, "c1").unwrap().is_none());
    }

    #[test]
    fn test_put_is_upsert() {
        let store = LocalStore::open_in_memory().unwrap();
        let mut c = checklist("c1");
        store.put(&EntityMirror::Checklist(c.clone())).unwrap();
        c.status = "COMPLETED".into();
        store.put(&EntityMirror::Checklist(c)).unwrap();

        assert_eq!(store.get_checklist("c1").unwrap().unwrap().status, "COMPLETED");
        assert_eq!(store.query(Collection::Checklists, |_| true).count(), 1);
        assert!(store.get_result("c1").unwrap().is_none());
    }
}

//! SQLite schema for the local durable store

use rusqlite::Connection;
use tracing::debug;

use crate::error::StoreError;

/// Current schema version, stored in `PRAGMA user_version`
pub const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            address TEXT,
            status TEXT NOT NULL,
            updated_at TEXT,
            stale INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS checklists (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            requirement_set_id TEXT,
            status TEXT NOT NULL,
            name TEXT NOT NULL,
            system_name TEXT,
            project_name TEXT,
            updated_at TEXT,
            stale INTEGER NOT NULL DEFAULT 0,
            dirty INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_checklists_project ON checklists(project_id);

        CREATE TABLE IF NOT EXISTS audit_results (
            id TEXT PRIMARY KEY,
            checklist_id TEXT NOT NULL,
            requirement_id TEXT NOT NULL,
            status TEXT NOT NULL,
            comment TEXT,
            photos TEXT NOT NULL DEFAULT '[]',
            requirement_content TEXT,
            requirement_clause TEXT,
            quantitative TEXT,
            updated_at TEXT,
            stale INTEGER NOT NULL DEFAULT 0,
            dirty INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_results_checklist ON audit_results(checklist_id);

        CREATE TABLE IF NOT EXISTS images (
            id TEXT PRIMARY KEY,
            result_id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            binary BLOB NOT NULL,
            content_type TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            byte_size INTEGER NOT NULL,
            uploaded INTEGER NOT NULL DEFAULT 0,
            public_url TEXT,
            provenance TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_images_result ON images(result_id);
        CREATE INDEX IF NOT EXISTS idx_images_uploaded ON images(uploaded);

        CREATE TABLE IF NOT EXISTS sync_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            type TEXT NOT NULL,
            target_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'PENDING',
            next_attempt_at INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            dead_reason TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_queue_target ON sync_queue(target_id, timestamp);
        CREATE INDEX IF NOT EXISTS idx_queue_status ON sync_queue(status);

        -- Last issued enqueue timestamp, survives an emptied queue
        CREATE TABLE IF NOT EXISTS queue_clock (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            last_timestamp INTEGER NOT NULL
        );
        "#,
    )?;

    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    debug!(version = SCHEMA_VERSION, "Schema initialized");
    Ok(())
}

//! Evidence blob rows

use rusqlite::{params, Connection, OptionalExtension, Row};
use sha2::{Digest, Sha256};

use crate::error::StoreError;
use crate::model::{EvidenceBlob, Provenance};

/// Compute SHA256 hash of data
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("sha256-{}", hex::encode(hasher.finalize()))
}

const META_COLUMNS: &str = "id, result_id, project_id, content_type, content_hash, byte_size, \
                            uploaded, public_url, provenance, created_at";

fn blob_from_row(row: &Row, binary: Vec<u8>) -> Result<EvidenceBlob, rusqlite::Error> {
    let provenance: Option<String> = row.get("provenance")?;
    let byte_size: i64 = row.get("byte_size")?;
    Ok(EvidenceBlob {
        id: row.get("id")?,
        result_id: row.get("result_id")?,
        project_id: row.get("project_id")?,
        binary,
        content_type: row.get("content_type")?,
        content_hash: row.get("content_hash")?,
        byte_size: byte_size as u64,
        uploaded: row.get("uploaded")?,
        public_url: row.get("public_url")?,
        // Unreadable provenance degrades to none rather than hiding the photo
        provenance: provenance.and_then(|p| serde_json::from_str::<Provenance>(&p).ok()),
        created_at: row.get("created_at")?,
    })
}

pub fn insert_blob(conn: &Connection, blob: &EvidenceBlob) -> Result<(), StoreError> {
    let provenance = blob
        .provenance
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        r#"
        INSERT INTO images (id, result_id, project_id, binary, content_type, content_hash,
                            byte_size, uploaded, public_url, provenance, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
        params![
            blob.id,
            blob.result_id,
            blob.project_id,
            blob.binary,
            blob.content_type,
            blob.content_hash,
            blob.byte_size as i64,
            blob.uploaded,
            blob.public_url,
            provenance,
            blob.created_at,
        ],
    )?;
    Ok(())
}

/// Full blob including the binary
pub fn get_blob(conn: &Connection, id: &str) -> Result<Option<EvidenceBlob>, StoreError> {
    let sql = format!("SELECT {}, binary FROM images WHERE id = ?1", META_COLUMNS);
    Ok(conn
        .query_row(&sql, params![id], |row| {
            let binary: Vec<u8> = row.get("binary")?;
            blob_from_row(row, binary)
        })
        .optional()?)
}

/// Blob metadata without loading the binary
pub fn get_blob_meta(conn: &Connection, id: &str) -> Result<Option<EvidenceBlob>, StoreError> {
    let sql = format!("SELECT {} FROM images WHERE id = ?1", META_COLUMNS);
    Ok(conn
        .query_row(&sql, params![id], |row| blob_from_row(row, Vec::new()))
        .optional()?)
}

pub fn blobs_for_result(conn: &Connection, result_id: &str) -> Result<Vec<EvidenceBlob>, StoreError> {
    let sql = format!(
        "SELECT {} FROM images WHERE result_id = ?1 ORDER BY created_at, id",
        META_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![result_id], |row| blob_from_row(row, Vec::new()))?;
    rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
}

/// Metadata of every blob not yet uploaded
pub fn pending_blobs(conn: &Connection) -> Result<Vec<EvidenceBlob>, StoreError> {
    let sql = format!(
        "SELECT {} FROM images WHERE uploaded = 0 ORDER BY created_at, id",
        META_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |row| blob_from_row(row, Vec::new()))?;
    rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
}

pub fn mark_uploaded(conn: &Connection, id: &str, public_url: &str) -> Result<bool, StoreError> {
    let changed = conn.execute(
        "UPDATE images SET uploaded = 1, public_url = ?2 WHERE id = ?1",
        params![id, public_url],
    )?;
    Ok(changed > 0)
}

pub fn has_pending_for_result(conn: &Connection, result_id: &str) -> Result<bool, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM images WHERE result_id = ?1 AND uploaded = 0",
        params![result_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn delete_uploaded_for_result(conn: &Connection, result_id: &str) -> Result<usize, StoreError> {
    Ok(conn.execute(
        "DELETE FROM images WHERE result_id = ?1 AND uploaded = 1",
        params![result_id],
    )?)
}

/// Bytes held by evidence binaries
pub fn total_bytes(conn: &Connection) -> Result<u64, StoreError> {
    let total: i64 = conn.query_row(
        "SELECT COALESCE(SUM(byte_size), 0) FROM images",
        [],
        |row| row.get(0),
    )?;
    Ok(total as u64)
}

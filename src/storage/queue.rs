//! sync_queue rows
//!
//! Row-level operations only; ordering and retry policy live in
//! `crate::sync::queue`.

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::StoreError;
use crate::sync::mutation::{
    DeadReason, Mutation, MutationId, MutationPayload, MutationStatus, MutationType, QueueCounts,
};

/// Dispatch lane a mutation belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    /// Result and checklist updates
    Structured,
    /// Evidence uploads
    Uploads,
}

fn conversion_error(msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, Type::Text, msg.into())
}

fn mutation_from_row(row: &Row) -> Result<Mutation, rusqlite::Error> {
    let mutation_type: String = row.get("type")?;
    let payload: String = row.get("payload")?;
    let status: String = row.get("status")?;
    let dead_reason: Option<String> = row.get("dead_reason")?;
    let attempts: i64 = row.get("attempts")?;

    Ok(Mutation {
        id: MutationId(row.get("id")?),
        mutation_type: mutation_type.parse::<MutationType>().map_err(conversion_error)?,
        target_id: row.get("target_id")?,
        payload: serde_json::from_str(&payload)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?,
        enqueued_at: row.get("timestamp")?,
        attempts: attempts as u32,
        status: status.parse::<MutationStatus>().map_err(conversion_error)?,
        next_attempt_at: row.get("next_attempt_at")?,
        last_error: row.get("last_error")?,
        dead_reason: dead_reason
            .map(|r| r.parse::<DeadReason>().map_err(conversion_error))
            .transpose()?,
    })
}

/// Next enqueue timestamp: wall clock, bumped past the last issued value so
/// keys stay unique and ordered even if the clock steps backwards.
fn next_timestamp(conn: &Connection, now_ms: i64) -> Result<i64, StoreError> {
    let last: Option<i64> = conn
        .query_row("SELECT last_timestamp FROM queue_clock WHERE id = 1", [], |row| row.get(0))
        .optional()?;
    let ts = match last {
        Some(last) if last >= now_ms => last + 1,
        _ => now_ms,
    };
    conn.execute(
        "INSERT INTO queue_clock (id, last_timestamp) VALUES (1, ?1)
         ON CONFLICT(id) DO UPDATE SET last_timestamp = excluded.last_timestamp",
        params![ts],
    )?;
    Ok(ts)
}

pub fn insert_mutation(
    conn: &Connection,
    target_id: &str,
    payload: &MutationPayload,
    now_ms: i64,
) -> Result<Mutation, StoreError> {
    let timestamp = next_timestamp(conn, now_ms)?;
    let mutation_type = payload.mutation_type();
    let payload_json = serde_json::to_string(payload)?;

    conn.execute(
        r#"
        INSERT INTO sync_queue (type, target_id, payload, timestamp, attempts, status, next_attempt_at)
        VALUES (?1, ?2, ?3, ?4, 0, 'PENDING', 0)
        "#,
        params![mutation_type.as_str(), target_id, payload_json, timestamp],
    )?;

    Ok(Mutation {
        id: MutationId(conn.last_insert_rowid()),
        mutation_type,
        target_id: target_id.to_string(),
        payload: payload.clone(),
        enqueued_at: timestamp,
        attempts: 0,
        status: MutationStatus::Pending,
        next_attempt_at: 0,
        last_error: None,
        dead_reason: None,
    })
}

pub fn get_mutation(conn: &Connection, id: MutationId) -> Result<Option<Mutation>, StoreError> {
    Ok(conn
        .query_row("SELECT * FROM sync_queue WHERE id = ?1", params![id.0], mutation_from_row)
        .optional()?)
}

/// Heads of per-target queues that may be dispatched now.
///
/// A head is the earliest non-dead mutation of its target. Targets whose
/// head is in flight or still backing off contribute nothing, which keeps
/// dispatch strictly ordered per target.
pub fn ready_heads(
    conn: &Connection,
    now_ms: i64,
    lane: Lane,
    limit: usize,
) -> Result<Vec<Mutation>, StoreError> {
    if limit == 0 {
        return Ok(Vec::new());
    }
    let lane_filter = match lane {
        Lane::Uploads => "q.type = 'UPLOAD_IMAGE'",
        Lane::Structured => "q.type != 'UPLOAD_IMAGE'",
    };
    let sql = format!(
        r#"
        SELECT q.* FROM sync_queue q
        WHERE q.status IN ('PENDING', 'FAILED')
          AND q.next_attempt_at <= ?1
          AND {}
          AND NOT EXISTS (
              SELECT 1 FROM sync_queue e
              WHERE e.target_id = q.target_id
                AND e.status != 'DEAD'
                AND (e.timestamp < q.timestamp OR (e.timestamp = q.timestamp AND e.id < q.id))
          )
        ORDER BY q.timestamp, q.id
        LIMIT ?2
        "#,
        lane_filter
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![now_ms, limit as i64], mutation_from_row)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
}

pub fn mark_in_flight(conn: &Connection, id: MutationId) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE sync_queue SET status = 'IN_FLIGHT' WHERE id = ?1",
        params![id.0],
    )?;
    Ok(())
}

pub fn delete_mutation(conn: &Connection, id: MutationId) -> Result<bool, StoreError> {
    Ok(conn.execute("DELETE FROM sync_queue WHERE id = ?1", params![id.0])? > 0)
}

/// Record a transient failure and schedule the next attempt
pub fn record_failure(
    conn: &Connection,
    id: MutationId,
    attempts: u32,
    next_attempt_at: i64,
    error: &str,
) -> Result<(), StoreError> {
    conn.execute(
        r#"
        UPDATE sync_queue
        SET status = 'FAILED', attempts = ?2, next_attempt_at = ?3, last_error = ?4
        WHERE id = ?1
        "#,
        params![id.0, attempts as i64, next_attempt_at, error],
    )?;
    Ok(())
}

pub fn mark_dead(
    conn: &Connection,
    id: MutationId,
    attempts: u32,
    reason: DeadReason,
    error: &str,
) -> Result<(), StoreError> {
    conn.execute(
        r#"
        UPDATE sync_queue
        SET status = 'DEAD', attempts = ?2, dead_reason = ?3, last_error = ?4
        WHERE id = ?1
        "#,
        params![id.0, attempts as i64, reason.as_str(), error],
    )?;
    Ok(())
}

/// Return interrupted dispatches to the pending state; attempts are kept
pub fn reset_in_flight(conn: &Connection) -> Result<usize, StoreError> {
    Ok(conn.execute(
        "UPDATE sync_queue SET status = 'PENDING' WHERE status = 'IN_FLIGHT'",
        [],
    )?)
}

/// Whether any non-dead mutation targets this entity
pub fn has_unsettled(conn: &Connection, target_id: &str) -> Result<bool, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sync_queue WHERE target_id = ?1 AND status != 'DEAD'",
        params![target_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Whether the target has any queue row, dead ones included
pub fn has_any(conn: &Connection, target_id: &str) -> Result<bool, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sync_queue WHERE target_id = ?1",
        params![target_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Whether an upload mutation exists for the blob in any state
pub fn has_upload_for(conn: &Connection, evidence_id: &str) -> Result<bool, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sync_queue WHERE target_id = ?1 AND type = 'UPLOAD_IMAGE'",
        params![evidence_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn list_by_status(
    conn: &Connection,
    status: MutationStatus,
) -> Result<Vec<Mutation>, StoreError> {
    let mut stmt = conn.prepare("SELECT * FROM sync_queue WHERE status = ?1 ORDER BY timestamp, id")?;
    let rows = stmt.query_map(params![status.as_str()], mutation_from_row)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
}

pub fn counts(conn: &Connection) -> Result<QueueCounts, StoreError> {
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM sync_queue GROUP BY status")?;
    let rows = stmt.query_map([], |row| {
        let status: String = row.get(0)?;
        let count: i64 = row.get(1)?;
        Ok((status, count as u64))
    })?;

    let mut counts = QueueCounts::default();
    for row in rows {
        let (status, count) = row?;
        match status.parse::<MutationStatus>() {
            Ok(MutationStatus::Pending) => counts.pending = count,
            Ok(MutationStatus::InFlight) => counts.in_flight = count,
            Ok(MutationStatus::Failed) => counts.failed = count,
            Ok(MutationStatus::Dead) => counts.dead = count,
            Err(e) => return Err(StoreError::Corrupt(e)),
        }
    }
    Ok(counts)
}

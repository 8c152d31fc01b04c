//! Call queue operations.
//!
//! Entries move `pending -> in_flight` through a single conditional UPDATE;
//! whoever changes the row owns the initiation. Successful initiation
//! deletes the row, failures park it as `failed`.

use chrono::{DateTime, Utc};
use rusqlite::params;

use super::models::{NewQueueEntry, QueueEntry};
use super::{opt_ts_col, ts_col, Database, StoreError};

const COLUMNS: &str = "id, contact_id, phone, first_name, full_name, email, full_address,
     attempt, status, scheduled_at, created_at, first_attempt_at,
     last_attempt_at, last_error, call_options, signed_url";

fn entry_from_row(row: &rusqlite::Row<'_>) -> Result<QueueEntry, rusqlite::Error> {
    Ok(QueueEntry {
        id: row.get(0)?,
        contact_id: row.get(1)?,
        phone: row.get(2)?,
        first_name: row.get(3)?,
        full_name: row.get(4)?,
        email: row.get(5)?,
        full_address: row.get(6)?,
        attempt: row.get(7)?,
        status: row.get(8)?,
        scheduled_at: ts_col(row, 9)?,
        created_at: ts_col(row, 10)?,
        first_attempt_at: ts_col(row, 11)?,
        last_attempt_at: opt_ts_col(row, 12)?,
        last_error: row.get(13)?,
        call_options: row.get(14)?,
        signed_url: row.get(15)?,
    })
}

/// Insert a new entry. Returns the queue id.
pub async fn insert(db: &Database, entry: NewQueueEntry) -> Result<i64, StoreError> {
    let id = db
        .connection()
        .call(move |conn| {
            conn.execute(
                "INSERT INTO call_queue
                 (contact_id, phone, first_name, full_name, email, full_address,
                  attempt, status, scheduled_at, created_at, first_attempt_at,
                  call_options, signed_url)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8, ?9, ?10, ?11, ?12)",
                params![
                    entry.contact_id,
                    entry.phone,
                    entry.first_name,
                    entry.full_name,
                    entry.email,
                    entry.full_address,
                    entry.attempt,
                    entry.scheduled_at.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                    entry.first_attempt_at.to_rfc3339(),
                    entry.call_options,
                    entry.signed_url,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await?;
    Ok(id)
}

/// Pending entries whose scheduled time has passed, oldest first.
pub async fn due_entries(
    db: &Database,
    now: DateTime<Utc>,
    limit: usize,
) -> Result<Vec<QueueEntry>, StoreError> {
    let entries = db
        .connection()
        .call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM call_queue
                 WHERE status = 'pending' AND scheduled_at <= ?1
                 ORDER BY scheduled_at ASC, id ASC
                 LIMIT ?2"
            ))?;
            let rows = stmt
                .query_map(params![now.to_rfc3339(), limit as i64], entry_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await?;
    Ok(entries)
}

/// Atomically take a pending entry for initiation.
///
/// Returns false if another tick already took it.
pub async fn claim(db: &Database, id: i64, now: DateTime<Utc>) -> Result<bool, StoreError> {
    let changed = db
        .connection()
        .call(move |conn| {
            let n = conn.execute(
                "UPDATE call_queue
                 SET status = 'in_flight', last_attempt_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                params![now.to_rfc3339(), id],
            )?;
            Ok(n)
        })
        .await?;
    Ok(changed == 1)
}

/// Remove an entry after the carrier accepted the call.
pub async fn delete(db: &Database, id: i64) -> Result<(), StoreError> {
    db.connection()
        .call(move |conn| {
            conn.execute("DELETE FROM call_queue WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await?;
    Ok(())
}

/// Park an entry whose initiation failed. The retry ladder does not apply
/// to initiation failures, so the entry stays out of dispatch.
pub async fn mark_failed(db: &Database, id: i64, error: &str) -> Result<(), StoreError> {
    let error = error.to_string();
    db.connection()
        .call(move |conn| {
            conn.execute(
                "UPDATE call_queue SET status = 'failed', last_error = ?1 WHERE id = ?2",
                params![error, id],
            )?;
            Ok(())
        })
        .await?;
    Ok(())
}

/// Reset in-flight entries orphaned by a crash back to pending.
///
/// Run once at startup, before the scheduler's first tick.
pub async fn recover_stale(
    db: &Database,
    older_than: DateTime<Utc>,
) -> Result<usize, StoreError> {
    let recovered = db
        .connection()
        .call(move |conn| {
            let n = conn.execute(
                "UPDATE call_queue
                 SET status = 'pending', last_error = 'stale in-flight recovered'
                 WHERE status = 'in_flight' AND last_attempt_at <= ?1",
                params![older_than.to_rfc3339()],
            )?;
            Ok(n)
        })
        .await?;
    Ok(recovered)
}

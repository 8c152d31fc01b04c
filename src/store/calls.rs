//! Call-state registry, keyed by the carrier call SID.
//!
//! The row is the synchronization point between the initiator and the
//! status ingress: there is no in-process locking.

use std::time::Duration;

use rusqlite::params;

use super::models::CallState;
use super::{opt_ts_col, ts_col, Database, StoreError};

/// How long a status callback waits for the initiator's write to land.
const LOOKUP_RETRY_DELAY: Duration = Duration::from_secs(2);

const COLUMNS: &str = "call_sid, phone, contact_id, attempt, status, created_at, signed_url,
     first_name, full_name, email, full_address, answered_by,
     conversation_id, first_attempt_at, retry_scheduled";

fn state_from_row(row: &rusqlite::Row<'_>) -> Result<CallState, rusqlite::Error> {
    Ok(CallState {
        call_sid: row.get(0)?,
        phone: row.get(1)?,
        contact_id: row.get(2)?,
        attempt: row.get(3)?,
        status: row.get(4)?,
        created_at: ts_col(row, 5)?,
        signed_url: row.get(6)?,
        first_name: row.get(7)?,
        full_name: row.get(8)?,
        email: row.get(9)?,
        full_address: row.get(10)?,
        answered_by: row.get(11)?,
        conversation_id: row.get(12)?,
        first_attempt_at: opt_ts_col(row, 13)?,
        retry_scheduled: row.get::<_, i64>(14)? != 0,
    })
}

pub async fn get(db: &Database, call_sid: &str) -> Result<Option<CallState>, StoreError> {
    let call_sid = call_sid.to_string();
    let state = db
        .connection()
        .call(move |conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {COLUMNS} FROM call_state WHERE call_sid = ?1"))?;
            match stmt.query_row(params![call_sid], state_from_row) {
                Ok(s) => Ok(Some(s)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
        .await?;
    Ok(state)
}

/// Like [`get`], but tolerates the window between carrier call creation and
/// the initiator's write: one extra attempt after a short sleep.
pub async fn get_waiting(db: &Database, call_sid: &str) -> Result<Option<CallState>, StoreError> {
    if let Some(state) = get(db, call_sid).await? {
        return Ok(Some(state));
    }
    tokio::time::sleep(LOOKUP_RETRY_DELAY).await;
    get(db, call_sid).await
}

/// Insert-or-replace the full row.
pub async fn put(db: &Database, state: CallState) -> Result<(), StoreError> {
    db.connection()
        .call(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO call_state
                 (call_sid, phone, contact_id, attempt, status, created_at, signed_url,
                  first_name, full_name, email, full_address, answered_by,
                  conversation_id, first_attempt_at, retry_scheduled)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    state.call_sid,
                    state.phone,
                    state.contact_id,
                    state.attempt,
                    state.status,
                    state.created_at.to_rfc3339(),
                    state.signed_url,
                    state.first_name,
                    state.full_name,
                    state.email,
                    state.full_address,
                    state.answered_by,
                    state.conversation_id,
                    state.first_attempt_at.map(|t| t.to_rfc3339()),
                    state.retry_scheduled as i64,
                ],
            )?;
            Ok(())
        })
        .await?;
    Ok(())
}

pub async fn set_status(db: &Database, call_sid: &str, status: &str) -> Result<(), StoreError> {
    let call_sid = call_sid.to_string();
    let status = status.to_string();
    db.connection()
        .call(move |conn| {
            conn.execute(
                "UPDATE call_state SET status = ?1 WHERE call_sid = ?2",
                params![status, call_sid],
            )?;
            Ok(())
        })
        .await?;
    Ok(())
}

pub async fn set_answered_by(
    db: &Database,
    call_sid: &str,
    answered_by: &str,
) -> Result<(), StoreError> {
    let call_sid = call_sid.to_string();
    let answered_by = answered_by.to_string();
    db.connection()
        .call(move |conn| {
            conn.execute(
                "UPDATE call_state SET answered_by = ?1 WHERE call_sid = ?2",
                params![answered_by, call_sid],
            )?;
            Ok(())
        })
        .await?;
    Ok(())
}

pub async fn set_conversation_id(
    db: &Database,
    call_sid: &str,
    conversation_id: &str,
) -> Result<(), StoreError> {
    let call_sid = call_sid.to_string();
    let conversation_id = conversation_id.to_string();
    db.connection()
        .call(move |conn| {
            conn.execute(
                "UPDATE call_state SET conversation_id = ?1 WHERE call_sid = ?2",
                params![conversation_id, call_sid],
            )?;
            Ok(())
        })
        .await?;
    Ok(())
}

/// Flip the retry latch. Returns true only for the caller that actually
/// performed the 0 -> 1 transition; everyone else must not schedule a retry.
pub async fn try_set_retry_latch(db: &Database, call_sid: &str) -> Result<bool, StoreError> {
    let call_sid = call_sid.to_string();
    let changed = db
        .connection()
        .call(move |conn| {
            let n = conn.execute(
                "UPDATE call_state SET retry_scheduled = 1
                 WHERE call_sid = ?1 AND retry_scheduled = 0",
                params![call_sid],
            )?;
            Ok(n)
        })
        .await?;
    Ok(changed == 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_state(call_sid: &str) -> CallState {
        CallState {
            call_sid: call_sid.to_string(),
            phone: "+390123456789".to_string(),
            contact_id: "c1".to_string(),
            attempt: 0,
            status: "initiated".to_string(),
            created_at: Utc::now(),
            signed_url: None,
            first_name: Some("Mario".to_string()),
            full_name: Some("Mario Rossi".to_string()),
            email: Some("m@example.com".to_string()),
            full_address: None,
            answered_by: None,
            conversation_id: None,
            first_attempt_at: Some(Utc::now()),
            retry_scheduled: false,
        }
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let db = Database::open_in_memory().await.unwrap();
        put(&db, sample_state("CA1")).await.unwrap();

        let state = get(&db, "CA1").await.unwrap().unwrap();
        assert_eq!(state.phone, "+390123456789");
        assert_eq!(state.attempt, 0);
        assert!(!state.retry_scheduled);

        assert!(get(&db, "CA2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_replaces_existing_row() {
        let db = Database::open_in_memory().await.unwrap();
        put(&db, sample_state("CA1")).await.unwrap();

        let mut updated = sample_state("CA1");
        updated.attempt = 3;
        put(&db, updated).await.unwrap();

        let state = get(&db, "CA1").await.unwrap().unwrap();
        assert_eq!(state.attempt, 3);
    }

    #[tokio::test]
    async fn latch_is_won_exactly_once() {
        let db = Database::open_in_memory().await.unwrap();
        put(&db, sample_state("CA1")).await.unwrap();

        assert!(try_set_retry_latch(&db, "CA1").await.unwrap());
        assert!(!try_set_retry_latch(&db, "CA1").await.unwrap());

        let state = get(&db, "CA1").await.unwrap().unwrap();
        assert!(state.retry_scheduled);
    }

    #[tokio::test]
    async fn partial_updates_leave_other_fields() {
        let db = Database::open_in_memory().await.unwrap();
        put(&db, sample_state("CA1")).await.unwrap();

        set_status(&db, "CA1", "ringing").await.unwrap();
        set_answered_by(&db, "CA1", "human").await.unwrap();
        set_conversation_id(&db, "CA1", "conv_9").await.unwrap();

        let state = get(&db, "CA1").await.unwrap().unwrap();
        assert_eq!(state.status, "ringing");
        assert_eq!(state.answered_by.as_deref(), Some("human"));
        assert_eq!(state.conversation_id.as_deref(), Some("conv_9"));
        assert_eq!(state.full_name.as_deref(), Some("Mario Rossi"));
    }

    #[tokio::test]
    async fn get_waiting_sees_late_write() {
        let db = Database::open_in_memory().await.unwrap();

        let db2 = db.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            put(&db2, sample_state("CA1")).await.unwrap();
        });

        let state = get_waiting(&db, "CA1").await.unwrap();
        assert!(state.is_some());
        writer.await.unwrap();
    }
}

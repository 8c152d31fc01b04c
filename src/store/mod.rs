//! Embedded SQLite store: call queue, call state, OAuth tokens.
//!
//! All access goes through a single `tokio_rusqlite::Connection`, which
//! serializes writes on its background thread. Multi-step transitions run
//! inside one transaction per row.

pub mod calls;
pub mod models;
pub mod queue;
pub mod tokens;

use tokio_rusqlite::Connection;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("call state for {0} missing after write")]
    VerifyFailed(String),
}

/// Handle to the embedded database.
#[derive(Clone)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the database file and bring the schema up to date.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path).await?;

        conn.call(|conn| {
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.pragma_update(None, "busy_timeout", 5000)?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            init_schema(conn)?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    /// In-memory database for tests.
    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        conn.call(|conn| {
            init_schema(conn)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Create tables and add any columns introduced since the row was first
/// written. Migrations are additive only; existing data is never dropped.
fn init_schema(conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS call_queue (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            contact_id       TEXT NOT NULL,
            phone            TEXT NOT NULL,
            first_name       TEXT,
            full_name        TEXT,
            email            TEXT,
            full_address     TEXT,
            attempt          INTEGER NOT NULL DEFAULT 0,
            status           TEXT NOT NULL DEFAULT 'pending',
            scheduled_at     TEXT NOT NULL,
            created_at       TEXT NOT NULL,
            first_attempt_at TEXT NOT NULL,
            last_attempt_at  TEXT,
            last_error       TEXT,
            call_options     TEXT,
            signed_url       TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_call_queue_due
            ON call_queue (status, scheduled_at);

        CREATE TABLE IF NOT EXISTS call_state (
            call_sid         TEXT PRIMARY KEY,
            phone            TEXT NOT NULL,
            contact_id       TEXT NOT NULL,
            attempt          INTEGER NOT NULL DEFAULT 0,
            status           TEXT NOT NULL,
            created_at       TEXT NOT NULL,
            signed_url       TEXT,
            first_name       TEXT,
            full_name        TEXT,
            email            TEXT,
            full_address     TEXT,
            answered_by      TEXT,
            conversation_id  TEXT,
            first_attempt_at TEXT,
            retry_scheduled  INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS oauth_tokens (
            location_id   TEXT PRIMARY KEY,
            access_token  TEXT NOT NULL,
            refresh_token TEXT NOT NULL,
            expires_at    TEXT NOT NULL
        );",
    )?;

    // Columns added after the first release.
    add_column_if_missing(conn, "call_queue", "call_options", "TEXT")?;
    add_column_if_missing(conn, "call_queue", "signed_url", "TEXT")?;
    add_column_if_missing(conn, "call_state", "conversation_id", "TEXT")?;
    add_column_if_missing(conn, "call_state", "full_address", "TEXT")?;
    add_column_if_missing(
        conn,
        "call_state",
        "retry_scheduled",
        "INTEGER NOT NULL DEFAULT 0",
    )?;

    Ok(())
}

/// Read an RFC 3339 TEXT column as `DateTime<Utc>`.
pub(crate) fn ts_col(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> Result<chrono::DateTime<chrono::Utc>, rusqlite::Error> {
    let s: String = row.get(idx)?;
    chrono::DateTime::parse_from_rfc3339(&s)
        .map(|d| d.with_timezone(&chrono::Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

/// Nullable variant of [`ts_col`].
pub(crate) fn opt_ts_col(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> Result<Option<chrono::DateTime<chrono::Utc>>, rusqlite::Error> {
    let s: Option<String> = row.get(idx)?;
    match s {
        None => Ok(None),
        Some(s) => chrono::DateTime::parse_from_rfc3339(&s)
            .map(|d| Some(d.with_timezone(&chrono::Utc)))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    idx,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            }),
    }
}

fn add_column_if_missing(
    conn: &rusqlite::Connection,
    table: &str,
    column: &str,
    decl: &str,
) -> Result<(), rusqlite::Error> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let exists = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .filter_map(Result::ok)
        .any(|name| name == column);

    if !exists {
        conn.execute(
            &format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"),
            [],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_init_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let path = path.to_str().unwrap();

        let db = Database::open(path).await.unwrap();
        drop(db);

        // Re-opening must not fail or lose data.
        let db = Database::open(path).await.unwrap();
        let count: i64 = db
            .connection()
            .call(|conn| {
                let n = conn.query_row("SELECT COUNT(*) FROM call_queue", [], |row| row.get(0))?;
                Ok(n)
            })
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn add_column_if_missing_only_adds_once() {
        let db = Database::open_in_memory().await.unwrap();
        db.connection()
            .call(|conn| {
                add_column_if_missing(conn, "call_queue", "extra_col", "TEXT")?;
                add_column_if_missing(conn, "call_queue", "extra_col", "TEXT")?;
                Ok(())
            })
            .await
            .unwrap();
    }
}

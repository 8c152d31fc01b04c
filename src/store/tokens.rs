//! CRM OAuth token storage.
//!
//! The core only reads tokens; the CRM client's refresh routine is the
//! single writer.

use rusqlite::params;

use super::models::OAuthTokenRecord;
use super::{ts_col, Database, StoreError};

pub async fn get(
    db: &Database,
    location_id: &str,
) -> Result<Option<OAuthTokenRecord>, StoreError> {
    let location_id = location_id.to_string();
    let record = db
        .connection()
        .call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT location_id, access_token, refresh_token, expires_at
                 FROM oauth_tokens WHERE location_id = ?1",
            )?;
            match stmt.query_row(params![location_id], |row| {
                Ok(OAuthTokenRecord {
                    location_id: row.get(0)?,
                    access_token: row.get(1)?,
                    refresh_token: row.get(2)?,
                    expires_at: ts_col(row, 3)?,
                })
            }) {
                Ok(r) => Ok(Some(r)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
        .await?;
    Ok(record)
}

pub async fn upsert(db: &Database, record: OAuthTokenRecord) -> Result<(), StoreError> {
    db.connection()
        .call(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO oauth_tokens
                 (location_id, access_token, refresh_token, expires_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.location_id,
                    record.access_token,
                    record.refresh_token,
                    record.expires_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn upsert_then_get() {
        let db = Database::open_in_memory().await.unwrap();

        upsert(
            &db,
            OAuthTokenRecord {
                location_id: "loc1".to_string(),
                access_token: "at".to_string(),
                refresh_token: "rt".to_string(),
                expires_at: Utc::now() + Duration::hours(1),
            },
        )
        .await
        .unwrap();

        let record = get(&db, "loc1").await.unwrap().unwrap();
        assert_eq!(record.access_token, "at");
        assert!(get(&db, "loc2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_overwrites() {
        let db = Database::open_in_memory().await.unwrap();
        for token in ["first", "second"] {
            upsert(
                &db,
                OAuthTokenRecord {
                    location_id: "loc1".to_string(),
                    access_token: token.to_string(),
                    refresh_token: "rt".to_string(),
                    expires_at: Utc::now(),
                },
            )
            .await
            .unwrap();
        }
        let record = get(&db, "loc1").await.unwrap().unwrap();
        assert_eq!(record.access_token, "second");
    }
}

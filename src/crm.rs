//! CRM surface: OAuth token access and contact enrichment.
//!
//! The orchestration core only needs a valid access token and, when the
//! queue entry arrived without display fields, the contact record behind
//! the contact id. Token refresh is the single writer of the token table.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Deserialize;

use crate::config::CrmConfig;
use crate::http;
use crate::schedule::clock;
use crate::store::models::OAuthTokenRecord;
use crate::store::{tokens, Database};

pub struct CrmClient {
    client: reqwest::Client,
    base_url: String,
    location_id: String,
    client_id: String,
    client_secret: String,
}

#[derive(Debug, Clone, Default)]
pub struct CrmContact {
    pub first_name: Option<String>,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub full_address: Option<String>,
}

impl CrmClient {
    pub fn new(crm_config: &CrmConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: crm_config.base_url.trim_end_matches('/').to_string(),
            location_id: crm_config.location_id.clone(),
            client_id: crm_config.client_id.clone(),
            client_secret: crm_config.client_secret.clone(),
        }
    }

    /// A currently-valid access token, refreshing first when the stored one
    /// has expired. `None` when the location was never authorized.
    pub async fn access_token(&self, db: &Database) -> Result<Option<String>, CrmError> {
        let Some(record) = tokens::get(db, &self.location_id).await? else {
            return Ok(None);
        };

        // A small margin so a token does not expire mid-request.
        if record.expires_at > Utc::now() + chrono::Duration::minutes(5) {
            return Ok(Some(record.access_token));
        }

        if self.client_id.is_empty() {
            tracing::warn!("CRM token expired and no client credentials configured");
            return Ok(None);
        }

        let refreshed = self.refresh(record).await?;
        let access_token = refreshed.access_token.clone();
        tokens::upsert(db, refreshed).await?;
        Ok(Some(access_token))
    }

    async fn refresh(&self, record: OAuthTokenRecord) -> Result<OAuthTokenRecord, CrmError> {
        let builder = self.client.post(format!("{}/oauth/token", self.base_url)).form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", record.refresh_token.as_str()),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ]);

        let resp = http::send_with_retry(builder, &http::CRM)
            .await
            .map_err(|e| CrmError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(CrmError::Api(format!("token refresh {status}: {body}")));
        }

        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| CrmError::Request(e.to_string()))?;

        tracing::info!(location_id = %record.location_id, "CRM token refreshed");
        Ok(OAuthTokenRecord {
            location_id: record.location_id,
            access_token: body.access_token,
            refresh_token: body.refresh_token.unwrap_or(record.refresh_token),
            expires_at: Utc::now() + chrono::Duration::seconds(body.expires_in),
        })
    }

    /// Look up a contact's display fields. Best-effort enrichment; callers
    /// treat `None` as "use what the queue entry already has".
    pub async fn fetch_contact(
        &self,
        db: &Database,
        contact_id: &str,
    ) -> Result<Option<CrmContact>, CrmError> {
        let Some(token) = self.access_token(db).await? else {
            return Ok(None);
        };

        let builder = self
            .client
            .get(format!("{}/contacts/{contact_id}", self.base_url))
            .bearer_auth(token)
            .header("Version", "2021-07-28");

        let resp = http::send_with_retry(builder, &http::CRM)
            .await
            .map_err(|e| CrmError::Request(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(CrmError::Api(format!("contact fetch {status}: {body}")));
        }

        let body: ContactResponse = resp
            .json()
            .await
            .map_err(|e| CrmError::Request(e.to_string()))?;

        let c = body.contact;
        Ok(Some(CrmContact {
            first_name: c.first_name,
            full_name: c.name,
            email: c.email,
            full_address: c.address1,
        }))
    }
}

/// Human-readable slot hint handed to the agent as a dynamic variable,
/// anchored to the next business day in the civil zone.
pub fn availability_window(now: DateTime<Utc>, tz: Tz) -> String {
    let day = clock::next_business_day(now, tz).with_timezone(&tz);
    format!("{} 9:00-18:00", day.format("%A %-d %B"))
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct ContactResponse {
    contact: ContactBody,
}

#[derive(Debug, Deserialize)]
struct ContactBody {
    #[serde(rename = "firstName", default)]
    first_name: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    address1: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum CrmError {
    #[error("HTTP request failed: {0}")]
    Request(String),
    #[error("CRM API error: {0}")]
    Api(String),
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn availability_is_anchored_to_business_days() {
        let tz = clock::parse_zone("Europe/Rome").unwrap();
        // Friday 2025-03-14: the next business day is Monday the 17th.
        let friday = Utc.with_ymd_and_hms(2025, 3, 14, 10, 0, 0).unwrap();
        assert_eq!(availability_window(friday, tz), "Monday 17 March 9:00-18:00");
    }
}

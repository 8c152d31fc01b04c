//! Twilio REST API client: call creation, active-call counting, hangup.

use serde::Deserialize;

use crate::config::TwilioConfig;
use crate::http;

const API_BASE: &str = "https://api.twilio.com/2010-04-01";

/// Ringing timeout before the carrier gives up on the callee.
const RING_TIMEOUT_SECS: u32 = 25;
/// Hard ceiling on call duration.
const TIME_LIMIT_SECS: u32 = 900;

pub struct TwilioClient {
    client: reqwest::Client,
    account_sid: String,
    auth_token: String,
    from_number: String,
}

/// Everything the carrier needs to place one call.
pub struct CallCreation {
    /// Destination, E.164.
    pub to: String,
    /// Where the carrier fetches TwiML once the callee answers.
    pub twiml_url: String,
    /// Where status and AMD events are posted.
    pub status_callback_url: String,
}

impl TwilioClient {
    pub fn new(twilio_config: &TwilioConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            account_sid: twilio_config.account_sid.clone(),
            auth_token: twilio_config.auth_token.clone(),
            from_number: twilio_config.phone_number.clone(),
        }
    }

    /// Create an outbound call and return the carrier-assigned call SID.
    ///
    /// Subscribes the status callback to the full lifecycle and enables
    /// asynchronous answering-machine detection posting to the same endpoint.
    pub async fn create_call(&self, req: &CallCreation) -> Result<String, TwilioError> {
        let url = format!("{API_BASE}/Accounts/{}/Calls.json", self.account_sid);

        let ring_timeout = RING_TIMEOUT_SECS.to_string();
        let time_limit = TIME_LIMIT_SECS.to_string();
        let params: Vec<(&str, &str)> = vec![
            ("To", req.to.as_str()),
            ("From", self.from_number.as_str()),
            ("Url", req.twiml_url.as_str()),
            ("Method", "POST"),
            ("Timeout", ring_timeout.as_str()),
            ("TimeLimit", time_limit.as_str()),
            ("StatusCallback", req.status_callback_url.as_str()),
            ("StatusCallbackMethod", "POST"),
            ("StatusCallbackEvent", "initiated"),
            ("StatusCallbackEvent", "ringing"),
            ("StatusCallbackEvent", "answered"),
            ("StatusCallbackEvent", "completed"),
            ("MachineDetection", "Enable"),
            ("AsyncAmd", "true"),
            ("AsyncAmdStatusCallback", req.status_callback_url.as_str()),
            ("AsyncAmdStatusCallbackMethod", "POST"),
        ];

        let builder = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&params);

        let resp = http::send_with_retry(builder, &http::CARRIER)
            .await
            .map_err(|e| TwilioError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(TwilioError::Api(format!("{status}: {body}")));
        }

        let body: CallResource = resp
            .json()
            .await
            .map_err(|e| TwilioError::Request(e.to_string()))?;

        tracing::info!(to = %req.to, call_sid = %body.sid, "Outbound call created");
        Ok(body.sid)
    }

    /// Count calls the carrier currently has queued, ringing or in progress.
    pub async fn active_call_count(&self) -> Result<usize, TwilioError> {
        let mut total = 0;
        for status in ["queued", "ringing", "in-progress"] {
            total += self.call_count_by_status(status).await?;
        }
        Ok(total)
    }

    async fn call_count_by_status(&self, status: &str) -> Result<usize, TwilioError> {
        let url = format!("{API_BASE}/Accounts/{}/Calls.json", self.account_sid);

        let builder = self
            .client
            .get(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .query(&[("Status", status), ("PageSize", "100")]);

        let resp = http::send_with_retry(builder, &http::CARRIER)
            .await
            .map_err(|e| TwilioError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            let status_code = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(TwilioError::Api(format!("{status_code}: {body}")));
        }

        let body: CallListPage = resp
            .json()
            .await
            .map_err(|e| TwilioError::Request(e.to_string()))?;

        Ok(body.calls.len())
    }

    /// Ask the carrier to hang up a live call. Used when AMD reports a
    /// machine mid-ring; best-effort at the call sites.
    pub async fn complete_call(&self, call_sid: &str) -> Result<(), TwilioError> {
        let url = format!(
            "{API_BASE}/Accounts/{}/Calls/{call_sid}.json",
            self.account_sid
        );

        let builder = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[("Status", "completed")]);

        let resp = http::send_with_retry(builder, &http::CARRIER)
            .await
            .map_err(|e| TwilioError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(TwilioError::Api(format!("{status}: {body}")));
        }

        tracing::info!(call_sid, "Carrier hangup requested");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct CallResource {
    sid: String,
}

#[derive(Debug, Deserialize)]
struct CallListPage {
    #[serde(default)]
    calls: Vec<serde_json::Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum TwilioError {
    #[error("HTTP request failed: {0}")]
    Request(String),
    #[error("Twilio API error: {0}")]
    Api(String),
}

//! Conversational-agent provider client: signed URL issuance.

use serde::Deserialize;

use crate::config::AgentConfig;
use crate::http;

const API_BASE: &str = "https://api.elevenlabs.io/v1/convai";

pub struct AgentClient {
    client: reqwest::Client,
    agent_id: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct SignedUrlResponse {
    signed_url: String,
}

impl AgentClient {
    pub fn new(agent_config: &AgentConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            agent_id: agent_config.agent_id.clone(),
            api_key: agent_config.api_key.clone(),
        }
    }

    /// Fetch a short-lived signed WebSocket URL for one conversation.
    pub async fn fetch_signed_url(&self) -> Result<String, AgentError> {
        let builder = self
            .client
            .get(format!("{API_BASE}/conversation/get_signed_url"))
            .query(&[("agent_id", self.agent_id.as_str())])
            .header("xi-api-key", &self.api_key);

        let resp = http::send_with_retry(builder, &http::AGENT)
            .await
            .map_err(|e| AgentError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(AgentError::Api(format!("{status}: {body}")));
        }

        let body: SignedUrlResponse = resp
            .json()
            .await
            .map_err(|e| AgentError::Request(e.to_string()))?;

        Ok(body.signed_url)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("HTTP request failed: {0}")]
    Request(String),
    #[error("agent API error: {0}")]
    Api(String),
}

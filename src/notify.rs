//! Fire-and-forget operational events to a chat webhook.
//!
//! Never on the critical path: sends happen on a spawned task and failures
//! are logged and dropped.

use std::time::Duration;

pub struct Notifier {
    client: reqwest::Client,
    webhook_url: String,
}

impl Notifier {
    pub fn new(webhook_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url: webhook_url.to_string(),
        }
    }

    /// Post a structured event. Returns immediately; the request runs in
    /// the background and its outcome cannot affect the caller.
    pub fn send(&self, event: &str, detail: serde_json::Value) {
        if self.webhook_url.is_empty() {
            tracing::debug!(event, "Notifier disabled, event dropped");
            return;
        }

        let client = self.client.clone();
        let url = self.webhook_url.clone();
        let event = event.to_string();
        let body = serde_json::json!({
            "text": format!("[outdial] {event}"),
            "event": event,
            "detail": detail,
        });

        tokio::spawn(async move {
            let result = client
                .post(&url)
                .timeout(Duration::from_secs(10))
                .json(&body)
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => {
                    tracing::warn!(event, status = %resp.status(), "Notifier webhook rejected event");
                }
                Err(e) => {
                    tracing::warn!(event, "Notifier webhook unreachable: {e}");
                }
            }
        });
    }
}

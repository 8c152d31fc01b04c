//! Retrying HTTP send shared by the carrier, agent and CRM clients.
//!
//! One policy per downstream; retries cover timeouts, transport errors,
//! 408, 429 and 5xx. Other 4xx responses are returned to the caller as-is.

use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub timeout: Duration,
}

/// Carrier control API: call creation, state fetch, termination.
pub const CARRIER: RetryPolicy = RetryPolicy {
    max_retries: 3,
    base_delay: Duration::from_secs(2),
    max_delay: Duration::from_secs(15),
    timeout: Duration::from_secs(20),
};

/// AI agent signed-URL issuance.
pub const AGENT: RetryPolicy = RetryPolicy {
    max_retries: 2,
    base_delay: Duration::from_secs(2),
    max_delay: Duration::from_secs(15),
    timeout: Duration::from_secs(15),
};

/// CRM API calls, including token refresh.
pub const CRM: RetryPolicy = RetryPolicy {
    max_retries: 3,
    base_delay: Duration::from_secs(2),
    max_delay: Duration::from_secs(15),
    timeout: Duration::from_secs(20),
};

/// Send a request, retrying transient failures with exponential backoff.
///
/// Returns the last response even when its status is an error, so callers
/// keep their own status handling; only transport-level failures and
/// exhausted retryable statuses surface as `Err`.
pub async fn send_with_retry(
    builder: RequestBuilder,
    policy: &RetryPolicy,
) -> Result<Response, HttpError> {
    let mut last_error = String::new();

    for attempt in 0..=policy.max_retries {
        let request = builder
            .try_clone()
            .ok_or(HttpError::NotRetryable)?
            .timeout(policy.timeout);

        match request.send().await {
            Ok(resp) if !is_retryable_status(resp.status()) => return Ok(resp),
            Ok(resp) => {
                last_error = format!("status {}", resp.status());
                if attempt == policy.max_retries {
                    return Ok(resp);
                }
            }
            Err(e) => {
                last_error = e.to_string();
                if attempt == policy.max_retries {
                    return Err(HttpError::Exhausted {
                        attempts: policy.max_retries + 1,
                        last_error,
                    });
                }
            }
        }

        let delay = backoff_delay(policy, attempt);
        tracing::debug!(attempt, ?delay, error = %last_error, "Retrying request");
        tokio::time::sleep(delay).await;
    }

    Err(HttpError::Exhausted {
        attempts: policy.max_retries + 1,
        last_error,
    })
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exp = policy.base_delay.saturating_mul(2u32.saturating_pow(attempt));
    exp.min(policy.max_delay)
}

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("request failed after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
    #[error("request body cannot be retried")]
    NotRetryable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(backoff_delay(&CARRIER, 0), Duration::from_secs(2));
        assert_eq!(backoff_delay(&CARRIER, 1), Duration::from_secs(4));
        assert_eq!(backoff_delay(&CARRIER, 2), Duration::from_secs(8));
        assert_eq!(backoff_delay(&CARRIER, 3), Duration::from_secs(15));
        assert_eq!(backoff_delay(&CARRIER, 10), Duration::from_secs(15));
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(StatusCode::REQUEST_TIMEOUT));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!is_retryable_status(StatusCode::OK));
    }
}

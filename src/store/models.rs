//! Row types for the embedded store.

use chrono::{DateTime, Utc};

/// A queued outbound call attempt.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: i64,
    pub contact_id: String,
    /// Destination number, E.164.
    pub phone: String,
    pub first_name: Option<String>,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub full_address: Option<String>,
    /// Zero-based attempt counter; 0 is the first call of a sequence.
    pub attempt: i64,
    /// "pending", "in_flight" or "failed".
    pub status: String,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// Instant of attempt 0, carried unchanged across every retry.
    pub first_attempt_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Opaque serialized carrier parameters (abrupt-retry context etc.).
    pub call_options: Option<String>,
    /// Pre-fetched agent signed URL, if any.
    pub signed_url: Option<String>,
}

/// Insert shape for `call_queue`; the store assigns id and created_at.
#[derive(Debug, Clone)]
pub struct NewQueueEntry {
    pub contact_id: String,
    pub phone: String,
    pub first_name: Option<String>,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub full_address: Option<String>,
    pub attempt: i64,
    pub scheduled_at: DateTime<Utc>,
    pub first_attempt_at: DateTime<Utc>,
    pub call_options: Option<String>,
    pub signed_url: Option<String>,
}

/// Tracked call, keyed by the carrier-assigned call SID.
#[derive(Debug, Clone)]
pub struct CallState {
    pub call_sid: String,
    pub phone: String,
    pub contact_id: String,
    pub attempt: i64,
    /// Free-text carrier status, most recent first write is "initiated".
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub signed_url: Option<String>,
    pub first_name: Option<String>,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub full_address: Option<String>,
    /// Carrier AMD classification: human, machine_*, fax, unknown.
    pub answered_by: Option<String>,
    /// Agent-assigned conversation id, populated once the bridge opens.
    pub conversation_id: Option<String>,
    pub first_attempt_at: Option<DateTime<Utc>>,
    /// One-way latch: once true, no further retry may be scheduled.
    pub retry_scheduled: bool,
}

/// CRM OAuth credentials for one location.
#[derive(Debug, Clone)]
pub struct OAuthTokenRecord {
    pub location_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

//! The call initiator: turns a claimed queue entry into a live carrier
//! call with a tracked call-state row.
//!
//! The carrier call id is external, so call creation and the call-state
//! write cannot share a transaction. The write-then-verify step bounds the
//! race; the status ingress covers the rest with its short lookup retry.

use chrono::Utc;

use crate::crm;
use crate::store::models::{CallState, QueueEntry};
use crate::store::{calls, queue};
use crate::twilio::client::CallCreation;
use crate::AppState;

pub async fn initiate(state: &AppState, entry: &QueueEntry) -> Result<String, InitiateError> {
    let entry = enrich_contact(state, entry).await;

    // A signed URL per attempt; reuse the pre-fetched one when present.
    let signed_url = match entry.signed_url.clone() {
        Some(url) => url,
        None => state
            .agent
            .fetch_signed_url()
            .await
            .map_err(|e| InitiateError::Agent(e.to_string()))?,
    };

    let base = state.config.public_route_base();
    let twiml_url = build_twiml_url(&base, &entry, state);
    let status_callback_url = format!("{base}/call-status");

    let call_sid = state
        .twilio
        .create_call(&CallCreation {
            to: entry.phone.clone(),
            twiml_url,
            status_callback_url,
        })
        .await
        .map_err(|e| InitiateError::Carrier(e.to_string()))?;

    // The row must exist before the first status callback is acknowledged.
    calls::put(
        &state.db,
        CallState {
            call_sid: call_sid.clone(),
            phone: entry.phone.clone(),
            contact_id: entry.contact_id.clone(),
            attempt: entry.attempt,
            status: "initiated".to_string(),
            created_at: Utc::now(),
            signed_url: Some(signed_url),
            first_name: entry.first_name.clone(),
            full_name: entry.full_name.clone(),
            email: entry.email.clone(),
            full_address: entry.full_address.clone(),
            answered_by: None,
            conversation_id: None,
            first_attempt_at: Some(entry.first_attempt_at),
            retry_scheduled: false,
        },
    )
    .await?;

    if calls::get(&state.db, &call_sid).await?.is_none() {
        state.notifier.send(
            "call_state_verify_failed",
            serde_json::json!({ "callSid": call_sid, "queueId": entry.id }),
        );
        return Err(InitiateError::VerifyFailed(call_sid));
    }

    queue::delete(&state.db, entry.id).await?;
    Ok(call_sid)
}

/// Fill in display fields the ingress did not provide. Best-effort: a CRM
/// hiccup never blocks the call.
async fn enrich_contact(state: &AppState, entry: &QueueEntry) -> QueueEntry {
    let mut entry = entry.clone();
    if entry.full_name.is_some() && entry.email.is_some() {
        return entry;
    }

    match state.crm.fetch_contact(&state.db, &entry.contact_id).await {
        Ok(Some(contact)) => {
            entry.first_name = entry.first_name.or(contact.first_name);
            entry.full_name = entry.full_name.or(contact.full_name);
            entry.email = entry.email.or(contact.email);
            entry.full_address = entry.full_address.or(contact.full_address);
        }
        Ok(None) => {}
        Err(e) => {
            tracing::warn!(contact_id = %entry.contact_id, "Contact enrichment failed: {e}");
        }
    }
    entry
}

/// The TwiML URL carries the whole per-call context, URL-encoded, so the
/// stream endpoint never needs a DB lookup.
fn build_twiml_url(base: &str, entry: &QueueEntry, state: &AppState) -> String {
    let mut params: Vec<(&str, String)> = vec![
        ("phone", entry.phone.clone()),
        ("contactId", entry.contact_id.clone()),
    ];
    if let Some(v) = &entry.first_name {
        params.push(("firstName", v.clone()));
    }
    if let Some(v) = &entry.full_name {
        params.push(("fullName", v.clone()));
    }
    if let Some(v) = &entry.email {
        params.push(("email", v.clone()));
    }
    if let Some(v) = &entry.full_address {
        params.push(("address", v.clone()));
    }
    params.push((
        "availability",
        crm::availability_window(Utc::now(), state.tz),
    ));

    // Abrupt-retry context rides along opaquely from the call options blob.
    if let Some(options) = entry
        .call_options
        .as_deref()
        .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
    {
        if let Some(summary) = options.get("pastCallSummary").and_then(|v| v.as_str()) {
            params.push(("abruptRetry", "true".to_string()));
            params.push(("pastCallSummary", summary.to_string()));
            if let Some(conv) = options.get("originalConversationId").and_then(|v| v.as_str()) {
                params.push(("originalConversationId", conv.to_string()));
            }
        }
    }

    let query: Vec<String> = params
        .iter()
        .map(|(k, v)| format!("{k}={}", urlencoded(v)))
        .collect();
    format!("{base}/outbound-call-twiml?{}", query.join("&"))
}

/// Simple URL encoding for query parameter values.
fn urlencoded(s: &str) -> String {
    s.bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                String::from(b as char)
            }
            _ => format!("%{b:02X}"),
        })
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum InitiateError {
    #[error("agent signed URL: {0}")]
    Agent(String),
    #[error("carrier call creation: {0}")]
    Carrier(String),
    #[error("call state row for {0} failed verification")]
    VerifyFailed(String),
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

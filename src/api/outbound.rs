//! Outbound-call ingress: enqueue the first attempt of a contact sequence.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::schedule::retry;
use crate::store::models::NewQueueEntry;
use crate::store::queue;
use crate::AppState;

/// Enqueue request. Upstream automations send several spellings per field;
/// the aliases absorb them here so nothing downstream deals with variants.
#[derive(Debug, Deserialize)]
pub struct OutboundCallRequest {
    #[serde(default, alias = "phoneNumber", alias = "Phone")]
    pub phone: Option<String>,
    #[serde(default, alias = "contactId", alias = "Id")]
    pub contact_id: Option<String>,
    #[serde(default, alias = "firstName", alias = "FirstName")]
    pub first_name: Option<String>,
    #[serde(default, alias = "fullName", alias = "name")]
    pub full_name: Option<String>,
    #[serde(default, alias = "Email")]
    pub email: Option<String>,
    #[serde(default, alias = "fullAddress", alias = "address")]
    pub full_address: Option<String>,
    /// Opaque extras; carried through to the carrier call options.
    #[serde(default, alias = "customData")]
    pub custom_data: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    success: bool,
    #[serde(rename = "queueId")]
    queue_id: i64,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    success: bool,
    error: String,
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            success: false,
            error: message.to_string(),
        }),
    )
        .into_response()
}

/// Handle POST /outbound-call.
pub async fn handle_outbound_call(
    State(state): State<AppState>,
    Json(req): Json<OutboundCallRequest>,
) -> Response {
    let Some(phone) = req.phone.as_deref().map(str::trim).filter(|p| !p.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "phone is required");
    };
    let Some(contact_id) = req
        .contact_id
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
    else {
        return error_response(StatusCode::BAD_REQUEST, "contact_id is required");
    };

    // First attempts dispatch as soon as a slot frees up.
    let schedule = retry::forced_immediate(Utc::now());

    let entry = NewQueueEntry {
        contact_id: contact_id.to_string(),
        phone: phone.to_string(),
        first_name: req.first_name.clone(),
        full_name: req.full_name.clone(),
        email: req.email.clone(),
        full_address: req.full_address.clone(),
        attempt: 0,
        scheduled_at: schedule.at,
        first_attempt_at: schedule.at,
        call_options: req.custom_data.as_ref().map(|v| v.to_string()),
        signed_url: None,
    };

    match queue::insert(&state.db, entry).await {
        Ok(queue_id) => {
            tracing::info!(queue_id, phone, contact_id, "Call enqueued");
            (
                StatusCode::ACCEPTED,
                Json(EnqueueResponse {
                    success: true,
                    queue_id,
                }),
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!(phone, "Failed to enqueue call: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_state;

    #[test]
    fn aliases_normalize_to_canonical_fields() {
        let req: OutboundCallRequest = serde_json::from_str(
            r#"{"phoneNumber":"+390123456789","contactId":"c1","firstName":"Mario"}"#,
        )
        .unwrap();
        assert_eq!(req.phone.as_deref(), Some("+390123456789"));
        assert_eq!(req.contact_id.as_deref(), Some("c1"));
        assert_eq!(req.first_name.as_deref(), Some("Mario"));

        let req: OutboundCallRequest =
            serde_json::from_str(r#"{"Phone":"+39","Id":"c2","name":"Mario Rossi"}"#).unwrap();
        assert_eq!(req.phone.as_deref(), Some("+39"));
        assert_eq!(req.contact_id.as_deref(), Some("c2"));
        assert_eq!(req.full_name.as_deref(), Some("Mario Rossi"));
    }

    #[tokio::test]
    async fn enqueue_creates_attempt_zero() {
        let state = test_state().await;
        let req: OutboundCallRequest = serde_json::from_str(
            r#"{"phone":"+390123456789","contact_id":"c1","full_name":"Mario Rossi"}"#,
        )
        .unwrap();

        let resp = handle_outbound_call(State(state.clone()), Json(req)).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let due = queue::due_entries(&state.db, Utc::now(), 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].attempt, 0);
        assert_eq!(due[0].status, "pending");
        assert_eq!(
            due[0].scheduled_at.timestamp(),
            due[0].first_attempt_at.timestamp()
        );
    }

    #[tokio::test]
    async fn missing_phone_is_rejected_without_state_change() {
        let state = test_state().await;
        let req: OutboundCallRequest = serde_json::from_str(r#"{"contact_id":"c1"}"#).unwrap();

        let resp = handle_outbound_call(State(state.clone()), Json(req)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(queue::due_entries(&state.db, Utc::now(), 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn custom_data_rides_in_call_options() {
        let state = test_state().await;
        let req: OutboundCallRequest = serde_json::from_str(
            r#"{"phone":"+39","contact_id":"c1",
                "customData":{"pastCallSummary":"cut off at pricing","originalConversationId":"conv_7"}}"#,
        )
        .unwrap();

        handle_outbound_call(State(state.clone()), Json(req)).await;

        let due = queue::due_entries(&state.db, Utc::now(), 10).await.unwrap();
        let options = due[0].call_options.as_deref().unwrap();
        assert!(options.contains("cut off at pricing"));
        assert!(options.contains("conv_7"));
    }
}

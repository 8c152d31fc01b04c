//! Carrier status callback ingress.
//!
//! Every event is classified against the call's answered-by field and
//! either acknowledged, turned into a hangup + retry (machine detection),
//! or turned into a retry via the ladder. The `retry_scheduled` latch on
//! the call-state row guarantees at most one retry per call SID no matter
//! how many callbacks the carrier delivers.

use axum::extract::{Form, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::Utc;
use serde::Deserialize;

use crate::schedule::retry;
use crate::store::models::{CallState, NewQueueEntry};
use crate::store::{calls, queue};
use crate::AppState;

/// Carrier AMD classifications that mean nobody human picked up.
const MACHINE_SET: &[&str] = &[
    "machine_start",
    "fax",
    "machine_beep",
    "machine_end_silence",
    "machine_end_other",
    "machine_end_beep",
];

#[derive(Debug, Deserialize)]
pub struct StatusCallback {
    #[serde(rename = "CallSid")]
    pub call_sid: String,
    #[serde(rename = "CallStatus")]
    pub call_status: String,
    #[serde(rename = "AnsweredBy", default)]
    pub answered_by: Option<String>,
    #[serde(rename = "To", default)]
    pub to: Option<String>,
}

/// What a single callback means for the retry state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Classification {
    /// Mid-call lifecycle noise; record and move on.
    Progress,
    /// AMD flagged a machine while the call is still up: hang up and retry.
    MachineMidCall,
    /// The attempt did not reach a human; consult the ladder.
    Retryable,
    /// A human was on the line; the sequence is done.
    Success,
    /// Over, and not worth another attempt.
    Terminal,
}

fn is_machine(answered_by: Option<&str>) -> bool {
    answered_by.is_some_and(|a| MACHINE_SET.contains(&a))
}

fn classify(call_status: &str, answered_by: Option<&str>) -> Classification {
    let machine = is_machine(answered_by);
    match call_status {
        "no-answer" | "busy" | "failed" => Classification::Retryable,
        "completed" | "canceled" => {
            if machine {
                Classification::Retryable
            } else if call_status == "completed" {
                Classification::Success
            } else {
                Classification::Terminal
            }
        }
        // initiated / ringing / answered / in-progress
        _ => {
            if machine {
                Classification::MachineMidCall
            } else {
                Classification::Progress
            }
        }
    }
}

/// Handle POST /call-status.
///
/// Replies 200 on every classified event; the carrier only sees an error
/// when the form itself does not parse.
pub async fn handle_status(
    State(state): State<AppState>,
    Form(event): Form<StatusCallback>,
) -> impl IntoResponse {
    tracing::info!(
        call_sid = %event.call_sid,
        status = %event.call_status,
        answered_by = event.answered_by.as_deref().unwrap_or("-"),
        to = event.to.as_deref().unwrap_or("-"),
        "Status callback"
    );

    if let Err(e) = process_event(&state, &event).await {
        // The callback is acknowledged regardless; the carrier retrying the
        // delivery would not make a store failure better.
        tracing::error!(call_sid = %event.call_sid, "Status processing failed: {e}");
    }

    (StatusCode::OK, "ok")
}

async fn process_event(
    state: &AppState,
    event: &StatusCallback,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Tolerate the race with the initiator's write before giving up.
    let Some(call) = calls::get_waiting(&state.db, &event.call_sid).await? else {
        tracing::warn!(call_sid = %event.call_sid, "Status for unknown call dropped");
        state.notifier.send(
            "status_unknown_call",
            serde_json::json!({
                "callSid": event.call_sid,
                "status": event.call_status,
            }),
        );
        return Ok(());
    };

    if call.retry_scheduled {
        tracing::debug!(call_sid = %event.call_sid, "Retry already scheduled, dropping event");
        return Ok(());
    }

    calls::set_status(&state.db, &event.call_sid, &event.call_status).await?;
    if let Some(answered_by) = event.answered_by.as_deref() {
        if call.answered_by.as_deref() != Some(answered_by) {
            calls::set_answered_by(&state.db, &event.call_sid, answered_by).await?;
        }
    }

    match classify(&event.call_status, event.answered_by.as_deref()) {
        Classification::Progress | Classification::Terminal => {}
        Classification::MachineMidCall => {
            if calls::try_set_retry_latch(&state.db, &event.call_sid).await? {
                // Best effort: the machine keeps talking otherwise.
                if let Err(e) = state.twilio.complete_call(&event.call_sid).await {
                    tracing::warn!(call_sid = %event.call_sid, "Hangup after AMD failed: {e}");
                }
                schedule_retry(state, &call, "machine_detected").await?;
            }
        }
        Classification::Retryable => {
            if calls::try_set_retry_latch(&state.db, &event.call_sid).await? {
                schedule_retry(state, &call, &event.call_status).await?;
            }
        }
        Classification::Success => {
            state.notifier.send(
                "call_completed_human",
                serde_json::json!({
                    "callSid": event.call_sid,
                    "phone": call.phone,
                    "contactId": call.contact_id,
                    "attempt": call.attempt,
                }),
            );
        }
    }

    Ok(())
}

/// Enqueue the next attempt of the sequence, or emit the terminal event if
/// the ladder is spent. Callers must hold the latch.
async fn schedule_retry(
    state: &AppState,
    call: &CallState,
    reason: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let max_attempts = state.config.queue.max_attempts;

    let schedule = if retry::is_exhausted(call.attempt, max_attempts) {
        None
    } else {
        retry::next(call.attempt, Utc::now(), state.tz)
    };

    let Some(schedule) = schedule else {
        tracing::warn!(
            call_sid = %call.call_sid,
            attempt = call.attempt,
            "Retry ladder exhausted, giving up on contact"
        );
        state.notifier.send(
            "retry_ladder_exhausted",
            serde_json::json!({
                "callSid": call.call_sid,
                "phone": call.phone,
                "contactId": call.contact_id,
                "attempts": call.attempt + 1,
            }),
        );
        return Ok(());
    };

    let first_attempt_at = call.first_attempt_at.unwrap_or(call.created_at);
    let queue_id = queue::insert(
        &state.db,
        NewQueueEntry {
            contact_id: call.contact_id.clone(),
            phone: call.phone.clone(),
            first_name: call.first_name.clone(),
            full_name: call.full_name.clone(),
            email: call.email.clone(),
            full_address: call.full_address.clone(),
            attempt: call.attempt + 1,
            scheduled_at: schedule.at,
            first_attempt_at,
            call_options: None,
            signed_url: None,
        },
    )
    .await?;

    tracing::info!(
        call_sid = %call.call_sid,
        queue_id,
        attempt = call.attempt + 1,
        scheduled_at = %schedule.at,
        kind = ?schedule.kind,
        reason,
        "Retry scheduled"
    );
    state.notifier.send(
        "retry_scheduled",
        serde_json::json!({
            "callSid": call.call_sid,
            "phone": call.phone,
            "queueId": queue_id,
            "attempt": call.attempt + 1,
            "scheduledAt": schedule.at.to_rfc3339(),
            "reason": reason,
        }),
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_state;
    use chrono::Duration;

    #[test]
    fn machine_set_membership() {
        assert!(is_machine(Some("machine_start")));
        assert!(is_machine(Some("fax")));
        assert!(is_machine(Some("machine_end_beep")));
        assert!(!is_machine(Some("human")));
        assert!(!is_machine(Some("unknown")));
        assert!(!is_machine(None));
    }

    #[test]
    fn classification_table() {
        // Mid-call statuses
        for status in ["initiated", "ringing", "in-progress"] {
            assert_eq!(
                classify(status, Some("machine_start")),
                Classification::MachineMidCall
            );
            assert_eq!(classify(status, Some("human")), Classification::Progress);
            assert_eq!(classify(status, None), Classification::Progress);
        }

        // Hard failures retry regardless of answered-by
        for status in ["no-answer", "busy", "failed"] {
            assert_eq!(classify(status, None), Classification::Retryable);
            assert_eq!(classify(status, Some("human")), Classification::Retryable);
        }

        // Terminal statuses depend on who answered
        assert_eq!(
            classify("completed", Some("machine_end_beep")),
            Classification::Retryable
        );
        assert_eq!(
            classify("canceled", Some("machine_start")),
            Classification::Retryable
        );
        assert_eq!(classify("completed", Some("human")), Classification::Success);
        assert_eq!(classify("completed", None), Classification::Success);
        assert_eq!(classify("canceled", Some("human")), Classification::Terminal);
    }

    fn tracked_call(call_sid: &str, attempt: i64) -> CallState {
        CallState {
            call_sid: call_sid.to_string(),
            phone: "+390123456789".to_string(),
            contact_id: "c1".to_string(),
            attempt,
            status: "initiated".to_string(),
            created_at: Utc::now(),
            signed_url: None,
            first_name: Some("Mario".to_string()),
            full_name: Some("Mario Rossi".to_string()),
            email: Some("m@example.com".to_string()),
            full_address: None,
            answered_by: None,
            conversation_id: None,
            first_attempt_at: Some(Utc::now() - Duration::hours(2)),
            retry_scheduled: false,
        }
    }

    fn no_answer(call_sid: &str) -> StatusCallback {
        StatusCallback {
            call_sid: call_sid.to_string(),
            call_status: "no-answer".to_string(),
            answered_by: None,
            to: Some("+390123456789".to_string()),
        }
    }

    #[tokio::test]
    async fn retryable_terminal_enqueues_next_attempt() {
        let state = test_state().await;
        let call = tracked_call("CA1", 0);
        let first = call.first_attempt_at.unwrap();
        calls::put(&state.db, call).await.unwrap();

        process_event(&state, &no_answer("CA1")).await.unwrap();

        let due = queue::due_entries(&state.db, Utc::now(), 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].attempt, 1);
        assert_eq!(due[0].first_attempt_at.timestamp(), first.timestamp());

        let tracked = calls::get(&state.db, "CA1").await.unwrap().unwrap();
        assert!(tracked.retry_scheduled);
    }

    #[tokio::test]
    async fn duplicate_terminal_events_schedule_one_retry() {
        let state = test_state().await;
        calls::put(&state.db, tracked_call("CA1", 0)).await.unwrap();

        let event = StatusCallback {
            call_sid: "CA1".to_string(),
            call_status: "completed".to_string(),
            answered_by: Some("machine_end_beep".to_string()),
            to: None,
        };
        process_event(&state, &event).await.unwrap();
        process_event(&state, &event).await.unwrap();

        let due = queue::due_entries(&state.db, Utc::now(), 10).await.unwrap();
        assert_eq!(due.len(), 1);
    }

    #[tokio::test]
    async fn exhausted_ladder_enqueues_nothing() {
        let state = test_state().await;
        calls::put(&state.db, tracked_call("CA1", 9)).await.unwrap();

        let event = StatusCallback {
            call_sid: "CA1".to_string(),
            call_status: "failed".to_string(),
            answered_by: None,
            to: None,
        };
        process_event(&state, &event).await.unwrap();

        assert!(queue::due_entries(&state.db, Utc::now(), 10)
            .await
            .unwrap()
            .is_empty());
        // The call record stays for observability.
        assert!(calls::get(&state.db, "CA1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn human_completion_is_terminal_success() {
        let state = test_state().await;
        calls::put(&state.db, tracked_call("CA1", 0)).await.unwrap();

        let event = StatusCallback {
            call_sid: "CA1".to_string(),
            call_status: "completed".to_string(),
            answered_by: Some("human".to_string()),
            to: None,
        };
        process_event(&state, &event).await.unwrap();

        assert!(queue::due_entries(&state.db, Utc::now(), 10)
            .await
            .unwrap()
            .is_empty());
        let tracked = calls::get(&state.db, "CA1").await.unwrap().unwrap();
        assert!(!tracked.retry_scheduled);
        assert_eq!(tracked.answered_by.as_deref(), Some("human"));
        assert_eq!(tracked.status, "completed");
    }

    #[tokio::test]
    async fn progress_events_only_update_status() {
        let state = test_state().await;
        calls::put(&state.db, tracked_call("CA1", 0)).await.unwrap();

        let event = StatusCallback {
            call_sid: "CA1".to_string(),
            call_status: "ringing".to_string(),
            answered_by: None,
            to: None,
        };
        process_event(&state, &event).await.unwrap();

        let tracked = calls::get(&state.db, "CA1").await.unwrap().unwrap();
        assert_eq!(tracked.status, "ringing");
        assert!(!tracked.retry_scheduled);
        assert!(queue::due_entries(&state.db, Utc::now(), 10)
            .await
            .unwrap()
            .is_empty());
    }
}

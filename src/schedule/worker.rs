//! The queue scheduler: a single long-running task that dispatches due
//! entries to the call initiator, bounded by the carrier concurrency cap.

use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;

use crate::initiator;
use crate::store::queue;
use crate::AppState;

/// Scheduler entry point. Runs the startup sweep once, then ticks forever.
/// A bad entry never kills the loop.
pub async fn run(state: AppState) {
    recover_orphans(&state).await;

    let mut interval = tokio::time::interval(Duration::from_millis(state.config.queue.interval_ms));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        if let Err(e) = tick(&state).await {
            tracing::error!("Queue tick failed: {e}");
        }
    }
}

/// Entries left `in_flight` by a crash between claim and initiation stay
/// invisible to dispatch forever; reset the stale ones before the first tick.
async fn recover_orphans(state: &AppState) {
    let cutoff = Utc::now() - chrono::Duration::seconds(state.config.queue.stale_after_secs);
    match queue::recover_stale(&state.db, cutoff).await {
        Ok(0) => {}
        Ok(n) => {
            tracing::warn!(recovered = n, "Reset stale in-flight queue entries");
            state.notifier.send(
                "queue_recovered_stale",
                serde_json::json!({ "entries": n }),
            );
        }
        Err(e) => tracing::error!("Stale in-flight recovery failed: {e}"),
    }
}

async fn tick(state: &AppState) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cap = state.config.queue.max_active_calls;

    let active = match state.twilio.active_call_count().await {
        Ok(n) => n,
        Err(e) => {
            // Fail closed: an unknown carrier load counts as a full cap.
            tracing::warn!("Active call count unavailable, skipping tick: {e}");
            cap
        }
    };

    let slots = available_slots(cap, active);
    if slots == 0 {
        return Ok(());
    }

    let due = queue::due_entries(&state.db, Utc::now(), slots).await?;

    for entry in due {
        if !queue::claim(&state.db, entry.id, Utc::now()).await? {
            // Another pass took it between select and claim.
            continue;
        }

        match initiator::initiate(state, &entry).await {
            Ok(call_sid) => {
                tracing::info!(
                    queue_id = entry.id,
                    phone = %entry.phone,
                    attempt = entry.attempt,
                    call_sid = %call_sid,
                    "Call initiated"
                );
            }
            Err(e) => {
                // Initiation failures are not carrier outcomes; the entry is
                // parked instead of consuming a ladder step.
                tracing::error!(queue_id = entry.id, phone = %entry.phone, "Initiation failed: {e}");
                queue::mark_failed(&state.db, entry.id, &e.to_string()).await?;
                state.notifier.send(
                    "call_initiation_failed",
                    serde_json::json!({
                        "queueId": entry.id,
                        "phone": entry.phone,
                        "attempt": entry.attempt,
                        "error": e.to_string(),
                    }),
                );
            }
        }
    }

    Ok(())
}

fn available_slots(cap: usize, active: usize) -> usize {
    cap.saturating_sub(active)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_never_go_negative() {
        assert_eq!(available_slots(3, 0), 3);
        assert_eq!(available_slots(3, 2), 1);
        assert_eq!(available_slots(3, 3), 0);
        assert_eq!(available_slots(3, 7), 0);
    }
}

//! The media bridge: one cooperative task per live call, owning both the
//! carrier media socket and the agent socket.
//!
//! Audio passes through base64-encoded in both directions; the bridge only
//! converts framing. Either side closing tears the whole bridge down.

use std::collections::HashMap;

use axum::extract::ws::{Message as CarrierMessage, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as AgentMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::agent::frames::{self, AgentEvent};
use crate::store::calls;
use crate::twilio::media::{StartMetadata, StreamEvent};
use crate::AppState;

type AgentWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Run the bridge for one call. Consumes the carrier socket; returns when
/// either peer is gone.
pub async fn run(socket: WebSocket, stream_sid: String, start: StartMetadata, state: AppState) {
    let call_sid = start.call_sid.clone();

    let agent_ws = match connect_agent(&state, &call_sid).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::error!(call_sid = %call_sid, "Agent connection failed: {e}");
            state.notifier.send(
                "bridge_agent_connect_failed",
                serde_json::json!({ "callSid": call_sid, "error": e.to_string() }),
            );
            // Nothing to bridge; let the carrier side drop.
            return;
        }
    };

    let (mut agent_tx, mut agent_rx) = agent_ws.split();
    let (mut carrier_tx, mut carrier_rx) = socket.split();

    // One initiation frame with the call context, before any audio. Every
    // TwiML parameter becomes a dynamic variable; the bridge interprets none.
    let init = frames::initiation_frame(
        &start.custom_parameters,
        first_message_override(&start.custom_parameters).as_deref(),
    );
    if let Err(e) = agent_tx.send(AgentMessage::Text(init.into())).await {
        tracing::error!(call_sid = %call_sid, "Failed to send initiation frame: {e}");
        return;
    }

    tracing::info!(call_sid = %call_sid, stream_sid = %stream_sid, "Bridge open");

    loop {
        tokio::select! {
            carrier_msg = carrier_rx.next() => {
                match handle_carrier_message(carrier_msg, &mut agent_tx, &call_sid).await {
                    Flow::Continue => {}
                    Flow::Stop => break,
                }
            }
            agent_msg = agent_rx.next() => {
                match handle_agent_message(
                    agent_msg,
                    &mut carrier_tx,
                    &mut agent_tx,
                    &stream_sid,
                    &call_sid,
                    &state,
                )
                .await
                {
                    Flow::Continue => {}
                    Flow::Stop => break,
                }
            }
        }
    }

    // Single teardown path: closing one side must close the other.
    let _ = agent_tx.send(AgentMessage::Close(None)).await;
    let _ = carrier_tx.send(CarrierMessage::Close(None)).await;

    tracing::info!(call_sid = %call_sid, "Bridge closed");
}

enum Flow {
    Continue,
    Stop,
}

/// Dial the agent with the pre-fetched signed URL if the call state has
/// one; fall back to a fresh URL when the cached one is missing or stale.
async fn connect_agent(
    state: &AppState,
    call_sid: &str,
) -> Result<AgentWs, Box<dyn std::error::Error + Send + Sync>> {
    let cached = match calls::get(&state.db, call_sid).await {
        Ok(call) => call.and_then(|c| c.signed_url),
        Err(e) => {
            tracing::warn!(call_sid, "Call state lookup failed before connect: {e}");
            None
        }
    };

    if let Some(url) = cached {
        match connect_async(url.as_str()).await {
            Ok((ws, _)) => return Ok(ws),
            Err(e) => {
                tracing::warn!(call_sid, "Cached signed URL failed, fetching fresh: {e}");
            }
        }
    }

    let url = state.agent.fetch_signed_url().await?;
    let (ws, _) = connect_async(url.as_str()).await?;
    Ok(ws)
}

async fn handle_carrier_message(
    msg: Option<Result<CarrierMessage, axum::Error>>,
    agent_tx: &mut SplitSink<AgentWs, AgentMessage>,
    call_sid: &str,
) -> Flow {
    let text = match msg {
        Some(Ok(CarrierMessage::Text(text))) => text,
        Some(Ok(CarrierMessage::Close(_))) | None => {
            tracing::info!(call_sid, "Carrier stream closed");
            return Flow::Stop;
        }
        Some(Err(e)) => {
            tracing::error!(call_sid, "Carrier WebSocket error: {e}");
            return Flow::Stop;
        }
        _ => return Flow::Continue,
    };

    let event: StreamEvent = match serde_json::from_str(&text) {
        Ok(e) => e,
        Err(e) => {
            tracing::warn!(call_sid, "Unparseable carrier frame: {e}");
            return Flow::Continue;
        }
    };

    match event {
        StreamEvent::Media { media } => {
            let frame = frames::user_audio_frame(&media.payload);
            if let Err(e) = agent_tx.send(AgentMessage::Text(frame.into())).await {
                tracing::error!(call_sid, "Agent send failed: {e}");
                return Flow::Stop;
            }
            Flow::Continue
        }
        StreamEvent::Stop { .. } => {
            tracing::info!(call_sid, "Carrier sent stop");
            Flow::Stop
        }
        _ => Flow::Continue,
    }
}

async fn handle_agent_message(
    msg: Option<Result<AgentMessage, tokio_tungstenite::tungstenite::Error>>,
    carrier_tx: &mut SplitSink<WebSocket, CarrierMessage>,
    agent_tx: &mut SplitSink<AgentWs, AgentMessage>,
    stream_sid: &str,
    call_sid: &str,
    state: &AppState,
) -> Flow {
    let text = match msg {
        Some(Ok(AgentMessage::Text(text))) => text,
        Some(Ok(AgentMessage::Close(frame))) => {
            if is_abnormal_close(frame.as_ref()) {
                tracing::warn!(call_sid, ?frame, "Agent closed abnormally");
                state.notifier.send(
                    "bridge_agent_abnormal_close",
                    serde_json::json!({
                        "callSid": call_sid,
                        "close": format!("{frame:?}"),
                    }),
                );
            } else {
                tracing::info!(call_sid, "Agent closed");
            }
            return Flow::Stop;
        }
        Some(Ok(_)) => return Flow::Continue,
        Some(Err(e)) => {
            tracing::error!(call_sid, "Agent WebSocket error: {e}");
            state.notifier.send(
                "bridge_agent_error",
                serde_json::json!({ "callSid": call_sid, "error": e.to_string() }),
            );
            return Flow::Stop;
        }
        None => {
            tracing::info!(call_sid, "Agent stream ended");
            return Flow::Stop;
        }
    };

    let event: AgentEvent = match serde_json::from_str(&text) {
        Ok(e) => e,
        Err(e) => {
            tracing::warn!(call_sid, "Unparseable agent frame: {e}");
            return Flow::Continue;
        }
    };

    if let Some(payload) = event.audio_payload() {
        let media = serde_json::json!({
            "event": "media",
            "streamSid": stream_sid,
            "media": { "payload": payload },
        });
        if let Err(e) = carrier_tx
            .send(CarrierMessage::Text(media.to_string().into()))
            .await
        {
            tracing::error!(call_sid, "Carrier send failed: {e}");
            return Flow::Stop;
        }
        return Flow::Continue;
    }

    match event {
        AgentEvent::Interruption => {
            // Drop whatever TTS audio the carrier still has queued.
            let clear = serde_json::json!({ "event": "clear", "streamSid": stream_sid });
            if let Err(e) = carrier_tx
                .send(CarrierMessage::Text(clear.to_string().into()))
                .await
            {
                tracing::error!(call_sid, "Carrier clear failed: {e}");
                return Flow::Stop;
            }
        }
        AgentEvent::Ping { ping_event } => {
            let event_id = ping_event.map(|p| p.event_id).unwrap_or_default();
            if let Err(e) = agent_tx
                .send(AgentMessage::Text(frames::pong_frame(event_id).into()))
                .await
            {
                tracing::error!(call_sid, "Pong failed: {e}");
                return Flow::Stop;
            }
        }
        AgentEvent::InitiationMetadata {
            conversation_initiation_metadata_event,
        } => {
            let conversation_id = conversation_initiation_metadata_event.conversation_id;
            tracing::info!(call_sid, conversation_id = %conversation_id, "Conversation started");
            if let Err(e) = calls::set_conversation_id(&state.db, call_sid, &conversation_id).await
            {
                tracing::warn!(call_sid, "Failed to persist conversation id: {e}");
            }
        }
        // Transcripts and agent responses are not the bridge's business.
        _ => {}
    }

    Flow::Continue
}

fn is_abnormal_close(frame: Option<&CloseFrame>) -> bool {
    match frame {
        None => false,
        Some(frame) => {
            let code = u16::from(frame.code);
            code != 1000 && code != 1005
        }
    }
}

fn first_message_override(params: &HashMap<String, String>) -> Option<String> {
    if params.get("abruptRetry").map(String::as_str) != Some("true") {
        return None;
    }
    let name = params
        .get("firstName")
        .filter(|n| !n.is_empty())
        .cloned()
        .unwrap_or_else(|| "there".to_string());
    Some(format!(
        "Hi {name}, sorry about that, it looks like our call dropped. Shall we pick up where we left off?"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    #[test]
    fn normal_closes_are_quiet() {
        assert!(!is_abnormal_close(None));
        assert!(!is_abnormal_close(Some(&CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        })));
        assert!(is_abnormal_close(Some(&CloseFrame {
            code: CloseCode::Away,
            reason: "".into(),
        })));
    }

    #[test]
    fn override_only_on_abrupt_retry() {
        let mut params = HashMap::new();
        params.insert("firstName".to_string(), "Mario".to_string());
        assert!(first_message_override(&params).is_none());

        params.insert("abruptRetry".to_string(), "true".to_string());
        let line = first_message_override(&params).unwrap();
        assert!(line.contains("Mario"));
    }
}

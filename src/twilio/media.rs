//! Twilio Media Stream WebSocket endpoint.
//!
//! Waits for the carrier's `start` frame, then hands the socket and the
//! per-call context over to the bridge for the rest of the call.

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use serde::Deserialize;

use crate::bridge;
use crate::AppState;

/// Twilio Media Stream WebSocket event types.
#[derive(Debug, Deserialize)]
#[serde(tag = "event")]
#[serde(rename_all = "lowercase")]
#[allow(dead_code)]
pub enum StreamEvent {
    Connected {
        #[serde(default)]
        protocol: Option<String>,
    },
    Start {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        start: StartMetadata,
    },
    Media {
        media: MediaPayload,
    },
    Mark {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
    Stop {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMetadata {
    pub call_sid: String,
    /// TwiML `<Parameter>` values: name parts, contact id, abrupt-retry
    /// context and friends.
    #[serde(default)]
    pub custom_parameters: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct MediaPayload {
    /// Base64-encoded mu-law audio.
    pub payload: String,
}

/// WebSocket upgrade handler for GET /outbound-media-stream.
pub async fn handle_media_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_media_stream(socket, state))
}

/// Read carrier frames until `start` arrives, then run the bridge.
async fn handle_media_stream(mut socket: WebSocket, state: AppState) {
    tracing::info!("Twilio media stream connected");

    loop {
        let msg = match socket.recv().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => {
                tracing::info!("Media stream closed before start");
                return;
            }
            Some(Err(e)) => {
                tracing::error!("WebSocket error before start: {e}");
                return;
            }
            _ => continue,
        };

        let event: StreamEvent = match serde_json::from_str(&msg) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!("Failed to parse stream event: {e}");
                continue;
            }
        };

        match event {
            StreamEvent::Connected { .. } => {
                tracing::info!("Stream connected");
            }
            StreamEvent::Start { stream_sid, start } => {
                tracing::info!(
                    call_sid = %start.call_sid,
                    stream_sid = %stream_sid,
                    "Stream started"
                );
                bridge::run(socket, stream_sid, start, state).await;
                return;
            }
            other => {
                tracing::debug!(?other, "Frame before start ignored");
            }
        }
    }
}

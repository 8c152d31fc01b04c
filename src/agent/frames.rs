//! Agent streaming protocol frames.
//!
//! Inbound frames are tagged by `type`; unknown types are ignored by the
//! bridge. The two audio envelopes both occur in the wild, so both are
//! accepted.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum AgentEvent {
    #[serde(rename = "conversation_initiation_metadata")]
    InitiationMetadata {
        conversation_initiation_metadata_event: InitiationMetadataEvent,
    },
    #[serde(rename = "audio")]
    Audio {
        #[serde(default)]
        audio: Option<AudioChunk>,
        #[serde(default)]
        audio_event: Option<AudioEvent>,
    },
    #[serde(rename = "interruption")]
    Interruption,
    #[serde(rename = "ping")]
    Ping {
        #[serde(default)]
        ping_event: Option<PingEvent>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct InitiationMetadataEvent {
    pub conversation_id: String,
}

#[derive(Debug, Deserialize)]
pub struct AudioChunk {
    pub chunk: String,
}

#[derive(Debug, Deserialize)]
pub struct AudioEvent {
    pub audio_base_64: String,
}

#[derive(Debug, Deserialize)]
pub struct PingEvent {
    pub event_id: i64,
}

impl AgentEvent {
    /// Base64 payload of an audio frame, from whichever envelope is present.
    pub fn audio_payload(&self) -> Option<&str> {
        match self {
            AgentEvent::Audio { audio, audio_event } => audio
                .as_ref()
                .map(|a| a.chunk.as_str())
                .or_else(|| audio_event.as_ref().map(|a| a.audio_base_64.as_str())),
            _ => None,
        }
    }
}

/// The one frame we send on open: conversation context for the agent.
pub fn initiation_frame(
    dynamic_variables: &HashMap<String, String>,
    first_message_override: Option<&str>,
) -> String {
    let mut frame = json!({
        "type": "conversation_initiation_client_data",
        "dynamic_variables": dynamic_variables,
    });
    if let Some(message) = first_message_override {
        frame["first_message_override"] = json!(message);
    }
    frame.to_string()
}

/// Caller audio, base64 mu-law passthrough from the carrier.
pub fn user_audio_frame(chunk: &str) -> String {
    json!({
        "type": "user_audio",
        "user_audio_chunk": chunk,
    })
    .to_string()
}

/// Reply to the provider's keepalive.
pub fn pong_frame(event_id: i64) -> String {
    json!({
        "type": "pong",
        "event_id": event_id,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_audio_envelopes() {
        let a: AgentEvent =
            serde_json::from_str(r#"{"type":"audio","audio":{"chunk":"QUJD"}}"#).unwrap();
        assert_eq!(a.audio_payload(), Some("QUJD"));

        let b: AgentEvent =
            serde_json::from_str(r#"{"type":"audio","audio_event":{"audio_base_64":"REVG"}}"#)
                .unwrap();
        assert_eq!(b.audio_payload(), Some("REVG"));
    }

    #[test]
    fn parses_ping_and_metadata() {
        let ping: AgentEvent =
            serde_json::from_str(r#"{"type":"ping","ping_event":{"event_id":7}}"#).unwrap();
        match ping {
            AgentEvent::Ping { ping_event } => assert_eq!(ping_event.unwrap().event_id, 7),
            other => panic!("expected ping, got {other:?}"),
        }

        let meta: AgentEvent = serde_json::from_str(
            r#"{"type":"conversation_initiation_metadata",
                "conversation_initiation_metadata_event":{"conversation_id":"conv_1"}}"#,
        )
        .unwrap();
        match meta {
            AgentEvent::InitiationMetadata {
                conversation_initiation_metadata_event,
            } => assert_eq!(
                conversation_initiation_metadata_event.conversation_id,
                "conv_1"
            ),
            other => panic!("expected metadata, got {other:?}"),
        }
    }

    #[test]
    fn unknown_types_fall_through() {
        let event: AgentEvent =
            serde_json::from_str(r#"{"type":"agent_response","text":"hi"}"#).unwrap();
        assert!(matches!(event, AgentEvent::Other));
        assert!(event.audio_payload().is_none());
    }

    #[test]
    fn initiation_frame_shape() {
        let mut vars = HashMap::new();
        vars.insert("firstName".to_string(), "Mario".to_string());

        let plain: serde_json::Value =
            serde_json::from_str(&initiation_frame(&vars, None)).unwrap();
        assert_eq!(plain["type"], "conversation_initiation_client_data");
        assert_eq!(plain["dynamic_variables"]["firstName"], "Mario");
        assert!(plain.get("first_message_override").is_none());

        let with_override: serde_json::Value =
            serde_json::from_str(&initiation_frame(&vars, Some("Ci risiamo!"))).unwrap();
        assert_eq!(with_override["first_message_override"], "Ci risiamo!");
    }

    #[test]
    fn outbound_frame_shapes() {
        let audio: serde_json::Value = serde_json::from_str(&user_audio_frame("QUJD")).unwrap();
        assert_eq!(audio["type"], "user_audio");
        assert_eq!(audio["user_audio_chunk"], "QUJD");

        let pong: serde_json::Value = serde_json::from_str(&pong_frame(7)).unwrap();
        assert_eq!(pong["type"], "pong");
        assert_eq!(pong["event_id"], 7);
    }
}

//! TwiML endpoint: instructs the carrier to open the media stream and
//! hands the per-call context through as stream parameters.

use axum::extract::{Query, RawForm, State};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::AppState;

/// Context the initiator embedded in the TwiML URL.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TwimlQuery {
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub contact_id: Option<String>,
    #[serde(default)]
    pub availability: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub abrupt_retry: Option<String>,
    #[serde(default)]
    pub past_call_summary: Option<String>,
    #[serde(default)]
    pub original_conversation_id: Option<String>,
}

/// Handle ALL /outbound-call-twiml.
///
/// The carrier fetches this once the callee answers; the response connects
/// the call to our media-stream WebSocket. Context values travel as
/// `<Parameter>`s so the stream handler needs no DB lookup.
pub async fn handle_twiml(
    State(state): State<AppState>,
    Query(query): Query<TwimlQuery>,
    RawForm(body): RawForm,
) -> Response {
    // CallSid arrives in the carrier's form body, not in our query string.
    let call_sid = form_value(&body, "CallSid").unwrap_or_default();

    let ws_url = media_stream_url(&state.config.public_route_base());

    let mut params = vec![("callSid", call_sid)];
    let pairs = [
        ("firstName", &query.first_name),
        ("fullName", &query.full_name),
        ("email", &query.email),
        ("phone", &query.phone),
        ("contactId", &query.contact_id),
        ("availability", &query.availability),
        ("address", &query.address),
        ("abruptRetry", &query.abrupt_retry),
        ("pastCallSummary", &query.past_call_summary),
        ("originalConversationId", &query.original_conversation_id),
    ];
    for (name, value) in pairs {
        if let Some(value) = value {
            params.push((name, value.clone()));
        }
    }

    let parameters: String = params
        .iter()
        .map(|(name, value)| {
            format!(
                "            <Parameter name=\"{}\" value=\"{}\" />\n",
                name,
                xml_escape(value)
            )
        })
        .collect();

    let twiml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Response>
    <Connect>
        <Stream url="{ws_url}">
{parameters}        </Stream>
    </Connect>
</Response>"#
    );

    ([("Content-Type", "text/xml")], twiml).into_response()
}

fn media_stream_url(route_base: &str) -> String {
    format!(
        "{}/outbound-media-stream",
        route_base
            .replace("https://", "wss://")
            .replace("http://", "ws://")
    )
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Pull one value out of a form-urlencoded body.
fn form_value(body: &[u8], key: &str) -> Option<String> {
    let body = std::str::from_utf8(body).ok()?;
    body.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        if k == key {
            Some(percent_decode(v))
        } else {
            None
        }
    })
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hi = (bytes[i + 1] as char).to_digit(16);
                let lo = (bytes[i + 2] as char).to_digit(16);
                if let (Some(hi), Some(lo)) = (hi, lo) {
                    out.push((hi * 16 + lo) as u8);
                    i += 3;
                } else {
                    out.push(bytes[i]);
                    i += 1;
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_xml_special_characters() {
        assert_eq!(
            xml_escape(r#"Rossi & Figli <srl> "quoted" 'single'"#),
            "Rossi &amp; Figli &lt;srl&gt; &quot;quoted&quot; &apos;single&apos;"
        );
        assert_eq!(xml_escape("plain"), "plain");
    }

    #[test]
    fn extracts_form_values() {
        let body = b"CallSid=CA123&CallStatus=ringing&To=%2B390123456789";
        assert_eq!(form_value(body, "CallSid").as_deref(), Some("CA123"));
        assert_eq!(form_value(body, "To").as_deref(), Some("+390123456789"));
        assert_eq!(form_value(body, "Missing"), None);
    }

    #[test]
    fn decodes_plus_and_percent() {
        assert_eq!(percent_decode("Mario+Rossi"), "Mario Rossi");
        assert_eq!(percent_decode("m%40example.com"), "m@example.com");
        assert_eq!(percent_decode("100%"), "100%");
    }

    #[test]
    fn media_url_swaps_scheme() {
        assert_eq!(
            media_stream_url("https://example.com/outgoing"),
            "wss://example.com/outgoing/outbound-media-stream"
        );
        assert_eq!(
            media_stream_url("http://localhost:8080/outgoing"),
            "ws://localhost:8080/outgoing/outbound-media-stream"
        );
    }
}

//! Gateway <-> agent control-channel wire format.
//!
//! One persistent bidirectional message stream carries JSON frames in both
//! directions. Gateway-to-agent frames are either a request descriptor or a
//! small `event_type`-tagged control frame; agent-to-gateway frames are
//! always tagged by `event_type` and carry the owning `request_id`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireStreamingMode {
    #[serde(rename = "real")]
    Real,
    #[serde(rename = "fake")]
    Fake,
}

/// Gateway -> agent: one upstream HTTPS call to execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    pub request_id: String,
    pub path: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub query_params: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub streaming_mode: WireStreamingMode,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_generative: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub client_wants_stream: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub resume_on_prohibit: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub resume_limit: u32,
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

/// Gateway -> agent control frames other than request descriptors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum ControlFrame {
    CancelRequest { request_id: String },
    SwitchSession { index: u32, storage_state: Value },
}

/// Every gateway -> agent frame. Descriptors carry no `event_type`, so the
/// tagged control variants must be tried first when decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AgentCommand {
    Control(ControlFrame),
    Request(Box<RequestDescriptor>),
}

/// Agent -> gateway frames, tagged by `event_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AgentEvent {
    ResponseHeaders {
        request_id: String,
        status: u16,
        headers: BTreeMap<String, String>,
    },
    Chunk {
        request_id: String,
        data: String,
    },
    StreamClose {
        request_id: String,
    },
    Error {
        request_id: String,
        status: u16,
        message: String,
    },
    SessionReady {
        index: u32,
    },
    SessionError {
        index: u32,
        message: String,
    },
}

impl AgentEvent {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::ResponseHeaders { request_id, .. }
            | Self::Chunk { request_id, .. }
            | Self::StreamClose { request_id }
            | Self::Error { request_id, .. } => Some(request_id),
            Self::SessionReady { .. } | Self::SessionError { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_and_cancel_share_one_decode_path() {
        let cancel = r#"{"event_type":"cancel_request","request_id":"r1"}"#;
        let decoded: AgentCommand = serde_json::from_str(cancel).unwrap();
        assert!(matches!(
            decoded,
            AgentCommand::Control(ControlFrame::CancelRequest { .. })
        ));

        let descriptor = serde_json::json!({
            "request_id": "r2",
            "path": "/v1beta/models/gemini-pro:generateContent",
            "method": "POST",
            "headers": {},
            "query_params": {},
            "streaming_mode": "fake",
        });
        let decoded: AgentCommand = serde_json::from_value(descriptor).unwrap();
        let AgentCommand::Request(descriptor) = decoded else {
            panic!("expected request descriptor");
        };
        assert_eq!(descriptor.request_id, "r2");
        assert_eq!(descriptor.streaming_mode, WireStreamingMode::Fake);
        assert!(!descriptor.resume_on_prohibit);
    }

    #[test]
    fn agent_events_round_trip_event_type_tags() {
        let event = AgentEvent::Error {
            request_id: "r3".to_string(),
            status: 504,
            message: "fetch timeout".to_string(),
        };
        let text = serde_json::to_string(&event).unwrap();
        assert!(text.contains(r#""event_type":"error""#));
        let back: AgentEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(back.request_id(), Some("r3"));
    }
}

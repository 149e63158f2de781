//! Client-facing WebSocket message types
//!
//! Every JSON frame in either direction carries a `kind` tag. Audio travels
//! as raw binary frames in both directions.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Incoming Messages (Client -> Relay)
// =============================================================================

/// Incoming WebSocket messages from the client
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Select a profile and start the session
    Init {
        /// Profile id
        profile: String,
    },

    /// Typed user input
    UserMessage {
        /// Text content, forwarded verbatim
        text: String,
    },

    /// Any other kind; ignored
    #[serde(other)]
    Other,
}

// =============================================================================
// Outgoing Messages (Relay -> Client)
// =============================================================================

/// Outgoing JSON messages to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DownstreamMessage {
    /// Incremental response text or audio transcript
    TextDelta {
        /// Item id, or the session id when the service gave none
        id: String,
        delta: String,
    },

    /// Transcript of the user's speech
    Transcription {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        text: String,
    },

    /// Lifecycle and out-of-band notifications
    Control(ControlMessage),
}

/// Control notification payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlMessage {
    pub action: ControlAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Service error object, verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    /// Service rate limit list, verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limits: Option<Value>,
    /// Raw function call argument string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call_params: Option<String>,
}

impl ControlMessage {
    pub fn new(action: ControlAction) -> Self {
        Self {
            action,
            id: None,
            error: None,
            rate_limits: None,
            function_call_params: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    SessionCreated,
    SpeechStarted,
    TextDone,
    Error,
    RateLimitsUpdated,
    FunctionCallOutput,
}

impl From<ControlMessage> for DownstreamMessage {
    fn from(control: ControlMessage) -> Self {
        DownstreamMessage::Control(control)
    }
}

/// Message routing for the client sender task
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRoute {
    /// JSON text message
    Outgoing(DownstreamMessage),
    /// Binary audio data
    Audio(Bytes),
    /// Close connection
    Close,
}

/// A client frame as seen by the session.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Text(String),
    Binary(Bytes),
    Close,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_deserialization() {
        let json = r#"{"kind": "init", "profile": "language-coach"}"#;
        let msg: ClientMessage = serde_json::from_str(json).expect("Should deserialize");
        match msg {
            ClientMessage::Init { profile } => assert_eq!(profile, "language-coach"),
            _ => panic!("Expected Init variant"),
        }
    }

    #[test]
    fn test_user_message_deserialization() {
        let json = r#"{"kind": "user_message", "text": "Hello, world!", "id": "abc"}"#;
        let msg: ClientMessage = serde_json::from_str(json).expect("Should deserialize");
        match msg {
            ClientMessage::UserMessage { text } => assert_eq!(text, "Hello, world!"),
            _ => panic!("Expected UserMessage variant"),
        }
    }

    #[test]
    fn test_unknown_kind_is_other() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"kind": "ping"}"#).expect("Should deserialize");
        assert_eq!(msg, ClientMessage::Other);
    }

    #[test]
    fn test_missing_kind_is_error() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"text": "hi"}"#).is_err());
    }

    #[test]
    fn test_text_delta_serialization() {
        let msg = DownstreamMessage::TextDelta {
            id: "item_1".to_string(),
            delta: "Hel".to_string(),
        };
        let json = serde_json::to_string(&msg).expect("Should serialize");
        assert!(json.contains(r#""kind":"text_delta""#));
        assert!(json.contains(r#""id":"item_1""#));
        assert!(json.contains(r#""delta":"Hel""#));
    }

    #[test]
    fn test_transcription_without_id() {
        let msg = DownstreamMessage::Transcription {
            id: None,
            text: "hello".to_string(),
        };
        let json = serde_json::to_string(&msg).expect("Should serialize");
        assert_eq!(json, r#"{"kind":"transcription","text":"hello"}"#);
    }

    #[test]
    fn test_control_serialization() {
        let mut control = ControlMessage::new(ControlAction::FunctionCallOutput).with_id("call_1");
        control.function_call_params = Some(r#"{"a":1}"#.to_string());
        let json: Value =
            serde_json::from_str(&serde_json::to_string(&DownstreamMessage::from(control)).unwrap())
                .unwrap();

        assert_eq!(json["kind"], "control");
        assert_eq!(json["action"], "function_call_output");
        assert_eq!(json["id"], "call_1");
        assert_eq!(json["functionCallParams"], r#"{"a":1}"#);
        assert!(json.get("error").is_none());
        assert!(json.get("rateLimits").is_none());
    }

    #[test]
    fn test_control_rate_limits_key() {
        let mut control = ControlMessage::new(ControlAction::RateLimitsUpdated);
        control.rate_limits = Some(serde_json::json!([{"name": "requests"}]));
        let json = serde_json::to_string(&DownstreamMessage::Control(control)).unwrap();
        assert!(json.contains(r#""rateLimits":[{"name":"requests"}]"#));
        assert!(json.contains(r#""action":"rate_limits_updated""#));
    }
}

//! Realtime service protocol and connection handling.

pub mod config;
pub mod connector;
pub mod messages;

pub use config::{
    Backend, DEFAULT_MAX_OUTPUT_TOKENS, DEFAULT_REALTIME_ENDPOINT, DEFAULT_REALTIME_MODEL,
    DEFAULT_SILENCE_DURATION_MS, DEFAULT_VAD_THRESHOLD, DEFAULT_VOICE, SessionSettings,
    UpstreamEndpoint,
};
pub use connector::{UpstreamConnection, UpstreamConnector, UpstreamHandle, build_handshake_request};
pub use messages::{
    ClientEvent, ConversationItem, ResponseConfig, SessionConfig, ToolDef, UpstreamEvent,
};

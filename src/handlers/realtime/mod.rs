//! Realtime relay WebSocket handlers
//!
//! # Protocol
//!
//! ## Client → Relay
//!
//! - **init**: `{"kind": "init", "profile": "<id>"}` selects a profile and
//!   starts the session. Unknown profiles are ignored; the client may retry.
//! - **user_message**: `{"kind": "user_message", "text": "..."}`
//! - **Binary frames**: PCM16 audio, batched before forwarding
//!
//! ## Relay → Client
//!
//! - **text_delta**: incremental response text or audio transcript
//! - **transcription**: transcript of the user's speech
//! - **control**: `session_created`, `speech_started`, `text_done`, `error`,
//!   `rate_limits_updated`, `function_call_output`
//! - **Binary frames**: response audio

pub mod messages;
pub mod router;
pub mod session;
mod supervisor;

pub use session::{RelaySession, SessionState};
pub use supervisor::{InitDecision, evaluate_init, realtime_handler};

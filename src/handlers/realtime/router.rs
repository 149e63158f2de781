//! Upstream event to client message mapping.
//!
//! [`route`] is a pure function of the relay session id and one upstream
//! event. Side effects tied to specific events (the greeting after
//! `session.created`, latency bookkeeping on response completion) live in
//! the session.

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use super::messages::{ClientRoute, ControlAction, ControlMessage, DownstreamMessage};
use crate::core::upstream::UpstreamEvent;

/// Map one upstream event to at most one client message.
pub fn route(session_id: &str, event: &UpstreamEvent) -> Option<ClientRoute> {
    match event {
        UpstreamEvent::SessionCreated { session } => {
            info!(
                upstream_session_id = ?session.as_ref().and_then(|s| s.id.as_deref()),
                "Upstream session created"
            );
            control(ControlMessage::new(ControlAction::SessionCreated).with_id(session_id))
        }

        UpstreamEvent::SessionUpdated => {
            info!("Upstream session configuration updated");
            None
        }

        UpstreamEvent::SpeechStarted { .. } => {
            control(ControlMessage::new(ControlAction::SpeechStarted))
        }

        UpstreamEvent::InputAudioBufferCommitted { transcript, .. } => {
            let text = transcript.as_deref().filter(|t| !t.is_empty())?;
            debug!(transcription_length = text.len(), "Input audio committed with transcript");
            outgoing(DownstreamMessage::Transcription {
                id: None,
                text: text.to_string(),
            })
        }

        UpstreamEvent::TranscriptionCompleted {
            item_id,
            transcript,
        } => {
            let text = transcript.as_deref().filter(|t| !t.is_empty())?;
            debug!(item_id = ?item_id, "Input transcription completed");
            outgoing(DownstreamMessage::Transcription {
                id: item_id.clone(),
                text: text.to_string(),
            })
        }

        UpstreamEvent::TranscriptionFailed { item_id, error } => {
            error!(item_id = ?item_id, error = %error, "Input transcription failed");
            None
        }

        UpstreamEvent::AudioDelta { delta, .. } => {
            if delta.is_empty() {
                return None;
            }
            match UpstreamEvent::decode_audio_delta(delta) {
                Ok(audio) => Some(ClientRoute::Audio(Bytes::from(audio))),
                Err(e) => {
                    warn!("Failed to decode audio delta: {}", e);
                    None
                }
            }
        }

        UpstreamEvent::TextDelta { item_id, delta }
        | UpstreamEvent::AudioTranscriptDelta { item_id, delta } => {
            if delta.is_empty() {
                return None;
            }
            outgoing(DownstreamMessage::TextDelta {
                id: content_id(session_id, item_id),
                delta: delta.clone(),
            })
        }

        UpstreamEvent::TextDone { item_id } | UpstreamEvent::AudioTranscriptDone { item_id } => {
            control(
                ControlMessage::new(ControlAction::TextDone)
                    .with_id(content_id(session_id, item_id)),
            )
        }

        UpstreamEvent::FunctionCallArgumentsDone { call_id, arguments } => {
            if arguments.is_empty() {
                warn!(call_id = ?call_id, "Function call completed without arguments");
                return None;
            }
            debug!(call_id = ?call_id, "Function call arguments completed");
            let mut message = ControlMessage::new(ControlAction::FunctionCallOutput);
            message.id = call_id.clone();
            message.function_call_params = Some(arguments.clone());
            control(message)
        }

        UpstreamEvent::Error { error } => {
            error!(
                error_type = ?error.get("type"),
                error_code = ?error.get("code"),
                event_id = ?error.get("event_id"),
                message = ?error.get("message"),
                "Realtime service error"
            );
            let mut message = ControlMessage::new(ControlAction::Error).with_id(session_id);
            message.error = Some(error.clone());
            control(message)
        }

        UpstreamEvent::RateLimitsUpdated { rate_limits } => {
            info!(rate_limits = %rate_limits, "Rate limits updated");
            let mut message =
                ControlMessage::new(ControlAction::RateLimitsUpdated).with_id(session_id);
            message.rate_limits = Some(rate_limits.clone());
            control(message)
        }

        UpstreamEvent::AudioDone { item_id } => {
            debug!(item_id = ?item_id, "Audio response completed");
            None
        }

        UpstreamEvent::ResponseDone { response } => {
            debug!(
                response_id = ?response.as_ref().and_then(|r| r.id.as_deref()),
                "Response generation completed"
            );
            None
        }

        UpstreamEvent::ContentPartAdded { item_id } => {
            debug!(item_id = ?item_id, "Content part added");
            None
        }

        UpstreamEvent::SpeechStopped
        | UpstreamEvent::InputAudioBufferCleared
        | UpstreamEvent::ConversationItemCreated
        | UpstreamEvent::ResponseCreated
        | UpstreamEvent::OutputItemAdded
        | UpstreamEvent::OutputItemDone
        | UpstreamEvent::FunctionCallArgumentsDelta
        | UpstreamEvent::Unknown => None,
    }
}

fn content_id(session_id: &str, item_id: &Option<String>) -> String {
    item_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .unwrap_or(session_id)
        .to_string()
}

fn outgoing(message: DownstreamMessage) -> Option<ClientRoute> {
    Some(ClientRoute::Outgoing(message))
}

fn control(message: ControlMessage) -> Option<ClientRoute> {
    outgoing(DownstreamMessage::Control(message))
}

//! Upstream realtime service settings.
//!
//! Covers backend selection, endpoint URL construction and the fixed
//! session profile pushed with every `session.update`.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::UpstreamConnectError;

/// Direct realtime WebSocket endpoint.
pub const DEFAULT_REALTIME_ENDPOINT: &str = "wss://api.openai.com/v1/realtime";

/// Model used when none is configured.
pub const DEFAULT_REALTIME_MODEL: &str = "gpt-realtime";

/// Voice used when none is configured.
pub const DEFAULT_VOICE: &str = "ash";

/// Input transcription model.
pub const DEFAULT_TRANSCRIPTION_MODEL: &str = "whisper-1";

/// Uplink audio format.
pub const DEFAULT_INPUT_AUDIO_FORMAT: &str = "pcm16";

pub const DEFAULT_VAD_THRESHOLD: f32 = 0.6;
pub const DEFAULT_SILENCE_DURATION_MS: u32 = 500;
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 4096;

// =============================================================================
// Backend
// =============================================================================

/// Which flavour of the realtime service to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Direct public endpoint
    #[default]
    #[serde(alias = "direct")]
    OpenAI,
    /// Managed cloud gateway (deployment + api-version addressing)
    #[serde(alias = "azure-openai", alias = "gateway")]
    Azure,
}

impl Backend {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAI => "openai",
            Self::Azure => "azure",
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" | "direct" | "" => Ok(Self::OpenAI),
            "azure" | "azure-openai" | "gateway" => Ok(Self::Azure),
            other => Err(format!("unknown backend '{other}'")),
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Endpoint
// =============================================================================

/// Where and how to reach the upstream service.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamEndpoint {
    pub backend: Backend,
    /// Base endpoint. For the gateway backend this is the resource URL
    /// (`https://…`); for the direct backend the realtime WebSocket URL.
    pub endpoint: Option<String>,
    /// Model, or deployment name on the gateway backend
    pub model: String,
    /// Gateway API version
    pub api_version: Option<String>,
}

impl Default for UpstreamEndpoint {
    fn default() -> Self {
        Self {
            backend: Backend::OpenAI,
            endpoint: None,
            model: DEFAULT_REALTIME_MODEL.to_string(),
            api_version: None,
        }
    }
}

impl UpstreamEndpoint {
    /// Build the WebSocket URL for this endpoint.
    pub fn websocket_url(&self) -> Result<Url, UpstreamConnectError> {
        match self.backend {
            Backend::OpenAI => {
                let base = self
                    .endpoint
                    .as_deref()
                    .filter(|e| !e.is_empty())
                    .unwrap_or(DEFAULT_REALTIME_ENDPOINT);
                let mut url = parse_url(base)?;
                url.query_pairs_mut().append_pair("model", &self.model);
                Ok(url)
            }
            Backend::Azure => {
                let endpoint = self.endpoint.as_deref().filter(|e| !e.is_empty()).ok_or_else(|| {
                    UpstreamConnectError::InvalidRequest(
                        "gateway backend requires an endpoint".to_string(),
                    )
                })?;
                let api_version = self.api_version.as_deref().ok_or_else(|| {
                    UpstreamConnectError::InvalidRequest(
                        "gateway backend requires an API version".to_string(),
                    )
                })?;

                let ws_base = to_websocket_scheme(endpoint);
                let mut url = parse_url(&format!(
                    "{}/openai/realtime",
                    ws_base.trim_end_matches('/')
                ))?;
                url.query_pairs_mut()
                    .append_pair("deployment", &self.model)
                    .append_pair("api-version", api_version);
                Ok(url)
            }
        }
    }
}

fn to_websocket_scheme(endpoint: &str) -> String {
    if let Some(rest) = endpoint.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = endpoint.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        endpoint.to_string()
    }
}

fn parse_url(raw: &str) -> Result<Url, UpstreamConnectError> {
    Url::parse(raw).map_err(|e| UpstreamConnectError::InvalidRequest(format!("{raw}: {e}")))
}

// =============================================================================
// Session profile
// =============================================================================

/// Fixed part of the `session.update` sent on every new upstream session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub voice: String,
    pub input_audio_format: String,
    pub transcription_model: String,
    pub vad_threshold: f32,
    pub silence_duration_ms: u32,
    pub max_output_tokens: u32,
    pub modalities: Vec<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            voice: DEFAULT_VOICE.to_string(),
            input_audio_format: DEFAULT_INPUT_AUDIO_FORMAT.to_string(),
            transcription_model: DEFAULT_TRANSCRIPTION_MODEL.to_string(),
            vad_threshold: DEFAULT_VAD_THRESHOLD,
            silence_duration_ms: DEFAULT_SILENCE_DURATION_MS,
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            modalities: vec!["text".to_string(), "audio".to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_url_uses_default_endpoint() {
        let endpoint = UpstreamEndpoint::default();
        let url = endpoint.websocket_url().unwrap();
        assert_eq!(url.as_str(), "wss://api.openai.com/v1/realtime?model=gpt-realtime");
    }

    #[test]
    fn test_direct_url_custom_endpoint_and_model() {
        let endpoint = UpstreamEndpoint {
            endpoint: Some("ws://127.0.0.1:9000/v1/realtime".to_string()),
            model: "my-model".to_string(),
            ..Default::default()
        };
        let url = endpoint.websocket_url().unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:9000/v1/realtime?model=my-model");
    }

    #[test]
    fn test_gateway_url_rewrites_scheme() {
        let endpoint = UpstreamEndpoint {
            backend: Backend::Azure,
            endpoint: Some("https://my-resource.openai.azure.com/".to_string()),
            model: "realtime-deploy".to_string(),
            api_version: Some("2024-10-01-preview".to_string()),
        };
        let url = endpoint.websocket_url().unwrap();
        assert_eq!(
            url.as_str(),
            "wss://my-resource.openai.azure.com/openai/realtime?deployment=realtime-deploy&api-version=2024-10-01-preview"
        );
    }

    #[test]
    fn test_gateway_requires_endpoint() {
        let endpoint = UpstreamEndpoint {
            backend: Backend::Azure,
            api_version: Some("2024-10-01-preview".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            endpoint.websocket_url(),
            Err(UpstreamConnectError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_backend_from_str() {
        assert_eq!("azure".parse::<Backend>().unwrap(), Backend::Azure);
        assert_eq!("OpenAI".parse::<Backend>().unwrap(), Backend::OpenAI);
        assert!("bedrock".parse::<Backend>().is_err());
    }

    #[test]
    fn test_session_settings_defaults() {
        let settings = SessionSettings::default();
        assert_eq!(settings.voice, "ash");
        assert_eq!(settings.vad_threshold, 0.6);
        assert_eq!(settings.silence_duration_ms, 500);
        assert_eq!(settings.max_output_tokens, 4096);
        assert_eq!(settings.modalities, vec!["text", "audio"]);
    }
}

use serde::Deserialize;
use std::path::Path;

use crate::errors::ConfigError;

/// Complete YAML configuration structure
///
/// Every field is optional; values present here override the environment.
///
/// # Example YAML structure
/// ```yaml
/// server:
///   host: "0.0.0.0"
///   port: 8080
///   cors_allowed_origins: "*"
///
/// upstream:
///   backend: azure
///   endpoint: "https://my-resource.openai.azure.com"
///   model: "gpt-realtime"
///   api_version: "2024-10-01-preview"
///
/// session:
///   voice: ash
///   vad_threshold: 0.6
///   silence_duration_ms: 500
///   max_output_tokens: 4096
///
/// audio:
///   batch_interval_ms: 200
///   max_buffer_size: 65536
///   max_queue_chunks: 10
///   backpressure_high_water: 1000000
///
/// credentials:
///   token_refresh_threshold_secs: 300
///
/// profiles:
///   path: "profiles.yaml"
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub server: Option<ServerYaml>,
    pub upstream: Option<UpstreamYaml>,
    pub session: Option<SessionYaml>,
    pub audio: Option<AudioYaml>,
    pub credentials: Option<CredentialsYaml>,
    pub profiles: Option<ProfilesYaml>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServerYaml {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub cors_allowed_origins: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct UpstreamYaml {
    pub backend: Option<String>,
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub api_version: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SessionYaml {
    pub voice: Option<String>,
    pub vad_threshold: Option<f32>,
    pub silence_duration_ms: Option<u32>,
    pub max_output_tokens: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AudioYaml {
    pub batch_interval_ms: Option<u64>,
    pub max_buffer_size: Option<usize>,
    pub max_queue_chunks: Option<usize>,
    pub backpressure_high_water: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CredentialsYaml {
    pub token_refresh_threshold_secs: Option<u64>,
    pub identity_endpoint: Option<String>,
    pub identity_header: Option<String>,
    pub identity_resource: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ProfilesYaml {
    pub path: Option<String>,
}

impl YamlConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&contents, path)
    }

    fn parse(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        serde_yaml::from_str(contents).map_err(|source| ConfigError::Yaml {
            path: path.display().to_string(),
            source,
        })
    }
}

//! Configuration module for the relay server
//!
//! Configuration comes from environment variables (with `.env` loaded in
//! `main`), optionally overridden by a YAML file. Priority:
//! YAML > ENV vars > .env values > defaults. The merged result is validated
//! before use.
//!
//! # Modules
//! - `env`: Environment variable helpers
//! - `yaml`: YAML configuration file loading
//! - `profiles`: Session profiles selected by clients
//!
//! # Example
//! ```rust,no_run
//! use realtime_relay::config::RelayConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variables only
//! let config = RelayConfig::from_env()?;
//!
//! // Load from YAML file with environment variables as the base
//! let config = RelayConfig::from_file(&PathBuf::from("relay.yaml"))?;
//!
//! println!("Server listening on {}", config.address());
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

mod env;
pub mod profiles;
mod yaml;

pub use profiles::{Profile, ProfileRegistry};
pub use yaml::YamlConfig;

use crate::core::audio::{
    AudioBatchConfig, DEFAULT_BACKPRESSURE_HIGH_WATER, DEFAULT_BACKPRESSURE_SATURATION,
    DEFAULT_MAX_BUFFER_SIZE, DEFAULT_MAX_QUEUE_CHUNKS,
};
use crate::core::credentials::{
    COGNITIVE_SERVICES_RESOURCE, CredentialProvider, DEFAULT_TOKEN_REFRESH_THRESHOLD,
    ManagedIdentityTokenSource,
};
use crate::core::upstream::{
    Backend, DEFAULT_MAX_OUTPUT_TOKENS, DEFAULT_REALTIME_MODEL, DEFAULT_SILENCE_DURATION_MS,
    DEFAULT_VAD_THRESHOLD, DEFAULT_VOICE, SessionSettings, UpstreamEndpoint,
};
use crate::errors::{ConfigError, CredentialError};
use env::{env_var, parse_env, parse_env_opt};

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_PROFILES_PATH: &str = "profiles.yaml";
pub const DEFAULT_BATCH_INTERVAL_MS: u64 = 200;

/// Relay server configuration
///
/// Contains everything needed to run the relay:
/// - Server settings (host, port, CORS)
/// - Upstream service addressing and static key
/// - Session profile defaults (voice, turn detection, token cap)
/// - Audio batching and backpressure thresholds
/// - Managed identity settings
#[derive(Clone)]
pub struct RelayConfig {
    // Server settings
    pub host: String,
    pub port: u16,
    /// CORS allowed origins (comma-separated list or "*" for all)
    pub cors_allowed_origins: Option<String>,

    // Upstream
    pub backend: Backend,
    pub endpoint: Option<String>,
    /// Model, or deployment name on the gateway backend
    pub model: String,
    pub api_version: Option<String>,
    pub api_key: Option<String>,

    // Session defaults
    pub voice: String,
    pub vad_threshold: f32,
    pub silence_duration_ms: u32,
    pub max_output_tokens: u32,

    // Audio uplink
    pub batch_interval_ms: u64,
    pub max_buffer_size: usize,
    pub max_queue_chunks: usize,
    pub backpressure_high_water: usize,

    // Managed identity
    pub token_refresh_threshold_secs: u64,
    pub identity_endpoint: Option<String>,
    pub identity_header: Option<String>,
    pub identity_resource: String,

    pub profiles_path: PathBuf,
}

/// Clear secrets from memory when the configuration is dropped.
impl Drop for RelayConfig {
    fn drop(&mut self) {
        use zeroize::Zeroize;

        if let Some(ref mut key) = self.api_key {
            key.zeroize();
        }
        if let Some(ref mut header) = self.identity_header {
            header.zeroize();
        }
    }
}

impl std::fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("backend", &self.backend)
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("api_version", &self.api_version)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("voice", &self.voice)
            .field("batch_interval_ms", &self.batch_interval_ms)
            .field("max_buffer_size", &self.max_buffer_size)
            .field("profiles_path", &self.profiles_path)
            .finish_non_exhaustive()
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            cors_allowed_origins: None,
            backend: Backend::OpenAI,
            endpoint: None,
            model: DEFAULT_REALTIME_MODEL.to_string(),
            api_version: None,
            api_key: None,
            voice: DEFAULT_VOICE.to_string(),
            vad_threshold: DEFAULT_VAD_THRESHOLD,
            silence_duration_ms: DEFAULT_SILENCE_DURATION_MS,
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            batch_interval_ms: DEFAULT_BATCH_INTERVAL_MS,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            max_queue_chunks: DEFAULT_MAX_QUEUE_CHUNKS,
            backpressure_high_water: DEFAULT_BACKPRESSURE_HIGH_WATER,
            token_refresh_threshold_secs: DEFAULT_TOKEN_REFRESH_THRESHOLD.as_secs(),
            identity_endpoint: None,
            identity_header: None,
            identity_resource: COGNITIVE_SERVICES_RESOURCE.to_string(),
            profiles_path: PathBuf::from(DEFAULT_PROFILES_PATH),
        }
    }
}

impl RelayConfig {
    /// Load configuration from environment variables and validate it.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::env_base()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variables as the base and the
    /// YAML file's values on top, then validate.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let yaml = YamlConfig::from_file(path)?;
        let mut config = Self::env_base()?;
        config.apply_yaml(yaml)?;
        config.validate()?;
        Ok(config)
    }

    fn env_base() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let backend = match env_var("BACKEND") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                name: "BACKEND",
                value: raw,
            })?,
            None => defaults.backend,
        };

        Ok(Self {
            host: env_var("HOST").unwrap_or_else(|| defaults.host.clone()),
            port: parse_env("PORT", defaults.port)?,
            cors_allowed_origins: env_var("CORS_ALLOWED_ORIGINS"),
            backend,
            endpoint: env_var("OPENAI_ENDPOINT"),
            model: env_var("OPENAI_MODEL").unwrap_or_else(|| defaults.model.clone()),
            api_version: env_var("OPENAI_API_VERSION"),
            api_key: env_var("OPENAI_API_KEY"),
            voice: env_var("REALTIME_VOICE").unwrap_or_else(|| defaults.voice.clone()),
            vad_threshold: parse_env("VAD_THRESHOLD", defaults.vad_threshold)?,
            silence_duration_ms: parse_env("SILENCE_DURATION_MS", defaults.silence_duration_ms)?,
            max_output_tokens: parse_env("MAX_OUTPUT_TOKENS", defaults.max_output_tokens)?,
            batch_interval_ms: parse_env("BATCH_INTERVAL_MS", defaults.batch_interval_ms)?,
            max_buffer_size: parse_env("MAX_BUFFER_SIZE", defaults.max_buffer_size)?,
            max_queue_chunks: parse_env("MAX_QUEUE_CHUNKS", defaults.max_queue_chunks)?,
            backpressure_high_water: parse_env(
                "BACKPRESSURE_HIGH_WATER",
                defaults.backpressure_high_water,
            )?,
            token_refresh_threshold_secs: parse_env(
                "TOKEN_REFRESH_THRESHOLD_SECS",
                defaults.token_refresh_threshold_secs,
            )?,
            identity_endpoint: env_var("IDENTITY_ENDPOINT"),
            identity_header: env_var("IDENTITY_HEADER"),
            identity_resource: env_var("IDENTITY_RESOURCE")
                .unwrap_or_else(|| defaults.identity_resource.clone()),
            profiles_path: parse_env_opt::<PathBuf>("PROFILES_PATH")?
                .unwrap_or_else(|| defaults.profiles_path.clone()),
        })
    }

    fn apply_yaml(&mut self, yaml: YamlConfig) -> Result<(), ConfigError> {
        if let Some(server) = yaml.server {
            if let Some(host) = server.host {
                self.host = host;
            }
            if let Some(port) = server.port {
                self.port = port;
            }
            if server.cors_allowed_origins.is_some() {
                self.cors_allowed_origins = server.cors_allowed_origins;
            }
        }

        if let Some(upstream) = yaml.upstream {
            if let Some(raw) = upstream.backend {
                self.backend = raw.parse().map_err(|_| ConfigError::InvalidValue {
                    name: "upstream.backend",
                    value: raw,
                })?;
            }
            if upstream.endpoint.is_some() {
                self.endpoint = upstream.endpoint;
            }
            if let Some(model) = upstream.model {
                self.model = model;
            }
            if upstream.api_version.is_some() {
                self.api_version = upstream.api_version;
            }
            if upstream.api_key.is_some() {
                self.api_key = upstream.api_key;
            }
        }

        if let Some(session) = yaml.session {
            if let Some(voice) = session.voice {
                self.voice = voice;
            }
            if let Some(threshold) = session.vad_threshold {
                self.vad_threshold = threshold;
            }
            if let Some(ms) = session.silence_duration_ms {
                self.silence_duration_ms = ms;
            }
            if let Some(tokens) = session.max_output_tokens {
                self.max_output_tokens = tokens;
            }
        }

        if let Some(audio) = yaml.audio {
            if let Some(ms) = audio.batch_interval_ms {
                self.batch_interval_ms = ms;
            }
            if let Some(size) = audio.max_buffer_size {
                self.max_buffer_size = size;
            }
            if let Some(chunks) = audio.max_queue_chunks {
                self.max_queue_chunks = chunks;
            }
            if let Some(high_water) = audio.backpressure_high_water {
                self.backpressure_high_water = high_water;
            }
        }

        if let Some(credentials) = yaml.credentials {
            if let Some(secs) = credentials.token_refresh_threshold_secs {
                self.token_refresh_threshold_secs = secs;
            }
            if credentials.identity_endpoint.is_some() {
                self.identity_endpoint = credentials.identity_endpoint;
            }
            if credentials.identity_header.is_some() {
                self.identity_header = credentials.identity_header;
            }
            if let Some(resource) = credentials.identity_resource {
                self.identity_resource = resource;
            }
        }

        if let Some(path) = yaml.profiles.and_then(|p| p.path) {
            self.profiles_path = PathBuf::from(path);
        }

        Ok(())
    }

    /// Check that the merged settings are usable together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.vad_threshold) {
            return Err(ConfigError::InvalidValue {
                name: "VAD_THRESHOLD",
                value: self.vad_threshold.to_string(),
            });
        }
        if self.batch_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "batch interval must be greater than zero".to_string(),
            ));
        }
        if self.max_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "max buffer size must be greater than zero".to_string(),
            ));
        }
        if self.max_queue_chunks == 0 {
            return Err(ConfigError::Invalid(
                "max queue chunks must be at least one".to_string(),
            ));
        }
        if self.backpressure_high_water == 0
            || self.backpressure_high_water > DEFAULT_BACKPRESSURE_SATURATION
        {
            return Err(ConfigError::Invalid(format!(
                "backpressure high water must be between 1 and {DEFAULT_BACKPRESSURE_SATURATION}"
            )));
        }

        match self.backend {
            Backend::OpenAI => {
                if self.api_key.is_none() {
                    return Err(ConfigError::Missing("OPENAI_API_KEY"));
                }
            }
            Backend::Azure => {
                if self.endpoint.is_none() {
                    return Err(ConfigError::Missing("OPENAI_ENDPOINT"));
                }
                if self.api_version.is_none() {
                    return Err(ConfigError::Missing("OPENAI_API_VERSION"));
                }
            }
        }

        Ok(())
    }

    /// Get the server address as "host:port".
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn upstream_endpoint(&self) -> UpstreamEndpoint {
        UpstreamEndpoint {
            backend: self.backend,
            endpoint: self.endpoint.clone(),
            model: self.model.clone(),
            api_version: self.api_version.clone(),
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            voice: self.voice.clone(),
            vad_threshold: self.vad_threshold,
            silence_duration_ms: self.silence_duration_ms,
            max_output_tokens: self.max_output_tokens,
            ..SessionSettings::default()
        }
    }

    pub fn audio_batch_config(&self) -> AudioBatchConfig {
        AudioBatchConfig {
            batch_interval: Duration::from_millis(self.batch_interval_ms),
            max_buffer_size: self.max_buffer_size,
            max_queue_chunks: self.max_queue_chunks,
            backpressure_high_water: self.backpressure_high_water,
            backpressure_saturation: DEFAULT_BACKPRESSURE_SATURATION,
        }
    }

    pub fn token_refresh_threshold(&self) -> Duration {
        Duration::from_secs(self.token_refresh_threshold_secs)
    }

    /// Build the credential provider implied by these settings.
    ///
    /// A static key always wins. Without one, the gateway backend falls back
    /// to the host's managed identity.
    pub fn credential_provider(&self) -> Result<CredentialProvider, CredentialError> {
        if let Some(key) = &self.api_key {
            return Ok(CredentialProvider::static_key(key.clone()));
        }

        match self.backend {
            Backend::Azure => {
                let source = ManagedIdentityTokenSource::new(
                    self.identity_endpoint.clone(),
                    self.identity_header.clone(),
                    self.identity_resource.clone(),
                )?;
                Ok(CredentialProvider::managed_identity(Arc::new(source))
                    .with_refresh_threshold(self.token_refresh_threshold()))
            }
            Backend::OpenAI => Ok(CredentialProvider::unconfigured()),
        }
    }
}

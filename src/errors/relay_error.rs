//! Error taxonomy for the relay.
//!
//! Only two kinds are fatal to a session: [`CredentialError`] and
//! [`UpstreamConnectError`]. Everything else is recovered at the frame
//! boundary and logged.

use thiserror::Error;

/// No usable auth material for the upstream connection.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// Neither a static key nor a managed identity is configured
    #[error("No credential source configured")]
    NotConfigured,

    /// The identity provider could not be reached or rejected the request
    #[error("Identity provider request failed: {0}")]
    ProviderRequest(String),

    /// The identity provider answered but returned no token
    #[error("Identity provider returned no token")]
    EmptyToken,
}

/// Failure to open or authenticate the upstream WebSocket link.
#[derive(Debug, Error)]
pub enum UpstreamConnectError {
    /// Auth material could not be obtained
    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    /// The upstream URL or handshake request could not be built
    #[error("Invalid upstream request: {0}")]
    InvalidRequest(String),

    /// WebSocket handshake or network failure
    #[error("Handshake failed: {0}")]
    Handshake(String),
}

/// Configuration loading or validation failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Environment variable has an unparseable value
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },

    /// A required setting is missing
    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    /// YAML file could not be read
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// YAML file is malformed
    #[error("Failed to parse {path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    /// Settings are individually valid but inconsistent
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    UpstreamConnect(#[from] UpstreamConnectError),

    /// Unparseable client or upstream frame; the frame is dropped
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Error event reported by the upstream service; forwarded to the client
    #[error("Upstream protocol error: {0}")]
    UpstreamProtocol(String),

    /// The upstream link is not open
    #[error("Upstream not connected")]
    NotConnected,

    /// The session has already been disposed
    #[error("Session disposed")]
    Disposed,
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::MalformedMessage(err.to_string())
    }
}

/// Result type for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_error_converts_to_connect_error() {
        let err: UpstreamConnectError = CredentialError::EmptyToken.into();
        assert!(matches!(err, UpstreamConnectError::Credential(_)));
        assert!(err.to_string().contains("no token"));
    }

    #[test]
    fn test_json_error_is_malformed_message() {
        let parse = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: RelayError = parse.into();
        assert!(matches!(err, RelayError::MalformedMessage(_)));
    }
}

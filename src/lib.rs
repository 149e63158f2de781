pub mod config;
pub mod core;
pub mod errors;
pub mod handlers;
pub mod routes;
pub mod state;

// Re-export commonly used items for convenience
pub use config::{Profile, ProfileRegistry, RelayConfig};
pub use crate::core::{
    AudioBatchConfig, AudioSink, AudioUplinkBuffer, CredentialProvider, UpstreamConnector,
    UpstreamEvent,
};
pub use errors::{
    ConfigError, CredentialError, RelayError, RelayResult, UpstreamConnectError,
};
pub use state::AppState;

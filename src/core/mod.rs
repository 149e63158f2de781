pub mod audio;
pub mod credentials;
pub mod upstream;

// Re-export commonly used types for convenience
pub use audio::{AudioBatchConfig, AudioMetrics, AudioSink, AudioUplinkBuffer, FlushOutcome};
pub use credentials::{AuthMaterial, CredentialProvider, ManagedIdentityTokenSource, TokenSource};
pub use upstream::{UpstreamConnection, UpstreamConnector, UpstreamEvent, UpstreamHandle};

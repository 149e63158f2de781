pub mod relay_error;

pub use relay_error::{
    ConfigError, CredentialError, RelayError, RelayResult, UpstreamConnectError,
};

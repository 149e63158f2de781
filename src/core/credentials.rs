//! Upstream credential acquisition and caching.
//!
//! A static API key is handed out as-is. A managed identity token is cached
//! process-wide and refreshed once it is within the refresh threshold of its
//! expiry; concurrent callers that find the cache stale wait on a single
//! in-flight refresh instead of each hitting the identity endpoint.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::errors::CredentialError;

/// Refresh a cached token when it has less than this left.
pub const DEFAULT_TOKEN_REFRESH_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// Token audience for the managed cloud gateway.
pub const COGNITIVE_SERVICES_RESOURCE: &str = "https://cognitiveservices.azure.com";

/// Instance metadata identity endpoint, used when no explicit endpoint is set.
pub const IMDS_TOKEN_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

const IMDS_API_VERSION: &str = "2018-02-01";
const APP_SERVICE_API_VERSION: &str = "2019-08-01";

// =============================================================================
// Auth material
// =============================================================================

/// What the connector attaches to the upstream handshake.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMaterial {
    /// Long-lived key from configuration
    ApiKey(String),
    /// Short-lived bearer token from the identity provider
    BearerToken(String),
}

impl AuthMaterial {
    pub fn secret(&self) -> &str {
        match self {
            Self::ApiKey(s) | Self::BearerToken(s) => s,
        }
    }
}

impl std::fmt::Debug for AuthMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApiKey(_) => f.write_str("ApiKey(***)"),
            Self::BearerToken(_) => f.write_str("BearerToken(***)"),
        }
    }
}

/// A token together with its absolute expiry.
#[derive(Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: SystemTime,
}

impl AccessToken {
    /// Whether the token is still usable for longer than `threshold`.
    pub fn is_fresh(&self, threshold: Duration) -> bool {
        match self.expires_at.duration_since(SystemTime::now()) {
            Ok(remaining) => remaining > threshold,
            Err(_) => false,
        }
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"***")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

// =============================================================================
// Token sources
// =============================================================================

/// Something that can mint access tokens.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch_token(&self) -> Result<AccessToken, CredentialError>;
}

/// Token response from the identity endpoint.
///
/// Instance metadata returns numbers as strings, App Service returns
/// numbers; both are accepted.
#[derive(Debug, Deserialize)]
struct IdentityTokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    expires_on: Option<NumberOrString>,
    #[serde(default)]
    expires_in: Option<NumberOrString>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(u64),
    String(String),
}

impl NumberOrString {
    fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::String(s) => s.trim().parse().ok(),
        }
    }
}

impl IdentityTokenResponse {
    fn into_access_token(self) -> Result<AccessToken, CredentialError> {
        if self.access_token.is_empty() {
            return Err(CredentialError::EmptyToken);
        }

        let expires_at = if let Some(on) = self.expires_on.as_ref().and_then(NumberOrString::as_u64)
        {
            UNIX_EPOCH.checked_add(Duration::from_secs(on))
        } else if let Some(secs) = self.expires_in.as_ref().and_then(NumberOrString::as_u64) {
            SystemTime::now().checked_add(Duration::from_secs(secs))
        } else {
            return Err(CredentialError::ProviderRequest(
                "token response carries no expiry".to_string(),
            ));
        }
        .ok_or_else(|| CredentialError::ProviderRequest("token expiry out of range".to_string()))?;

        Ok(AccessToken {
            token: self.access_token,
            expires_at,
        })
    }
}

/// Fetches tokens from the host's managed identity endpoint.
///
/// With `IDENTITY_ENDPOINT`/`IDENTITY_HEADER` set (App Service, Container
/// Apps) those are used; otherwise the instance metadata service.
pub struct ManagedIdentityTokenSource {
    client: reqwest::Client,
    endpoint: String,
    identity_header: Option<String>,
    resource: String,
}

impl ManagedIdentityTokenSource {
    pub fn new(
        endpoint: Option<String>,
        identity_header: Option<String>,
        resource: impl Into<String>,
    ) -> Result<Self, CredentialError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(2)
            .build()
            .map_err(|e| {
                CredentialError::ProviderRequest(format!("Failed to create HTTP client: {e}"))
            })?;

        Ok(Self {
            client,
            endpoint: endpoint.unwrap_or_else(|| IMDS_TOKEN_ENDPOINT.to_string()),
            identity_header,
            resource: resource.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl TokenSource for ManagedIdentityTokenSource {
    async fn fetch_token(&self) -> Result<AccessToken, CredentialError> {
        let mut request = self.client.get(&self.endpoint);
        request = match &self.identity_header {
            Some(header) => request
                .header("X-IDENTITY-HEADER", header)
                .query(&[
                    ("resource", self.resource.as_str()),
                    ("api-version", APP_SERVICE_API_VERSION),
                ]),
            None => request.header("Metadata", "true").query(&[
                ("resource", self.resource.as_str()),
                ("api-version", IMDS_API_VERSION),
            ]),
        };

        let response = request.send().await.map_err(|e| {
            CredentialError::ProviderRequest(format!("Failed to request token: {e}"))
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(CredentialError::ProviderRequest(format!(
                "Token request failed ({status}): {body}"
            )));
        }

        let token_response: IdentityTokenResponse = response.json().await.map_err(|e| {
            CredentialError::ProviderRequest(format!("Failed to parse token response: {e}"))
        })?;

        token_response.into_access_token()
    }
}

// =============================================================================
// Provider
// =============================================================================

enum CredentialMode {
    Static(Zeroizing<String>),
    ManagedIdentity(Arc<dyn TokenSource>),
    Unconfigured,
}

/// Shared credential source for every session.
pub struct CredentialProvider {
    mode: CredentialMode,
    refresh_threshold: Duration,
    cached: RwLock<Option<AccessToken>>,
    refresh_lock: Mutex<()>,
}

impl CredentialProvider {
    fn with_mode(mode: CredentialMode) -> Self {
        Self {
            mode,
            refresh_threshold: DEFAULT_TOKEN_REFRESH_THRESHOLD,
            cached: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Always return the given key.
    pub fn static_key(api_key: impl Into<String>) -> Self {
        Self::with_mode(CredentialMode::Static(Zeroizing::new(api_key.into())))
    }

    /// Fetch and cache tokens from `source`.
    pub fn managed_identity(source: Arc<dyn TokenSource>) -> Self {
        Self::with_mode(CredentialMode::ManagedIdentity(source))
    }

    /// No usable credential; every acquire fails.
    pub fn unconfigured() -> Self {
        Self::with_mode(CredentialMode::Unconfigured)
    }

    pub fn with_refresh_threshold(mut self, threshold: Duration) -> Self {
        self.refresh_threshold = threshold;
        self
    }

    pub fn refresh_threshold(&self) -> Duration {
        self.refresh_threshold
    }

    pub fn is_static(&self) -> bool {
        matches!(self.mode, CredentialMode::Static(_))
    }

    /// Auth material for a new upstream connection.
    pub async fn acquire(&self) -> Result<AuthMaterial, CredentialError> {
        match &self.mode {
            CredentialMode::Static(key) => Ok(AuthMaterial::ApiKey(key.as_str().to_owned())),
            CredentialMode::ManagedIdentity(source) => {
                let token = self.cached_or_refresh(source.as_ref()).await?;
                Ok(AuthMaterial::BearerToken(token))
            }
            CredentialMode::Unconfigured => Err(CredentialError::NotConfigured),
        }
    }

    fn fresh_cached(&self) -> Option<String> {
        self.cached
            .read()
            .as_ref()
            .filter(|t| t.is_fresh(self.refresh_threshold))
            .map(|t| t.token.clone())
    }

    async fn cached_or_refresh(&self, source: &dyn TokenSource) -> Result<String, CredentialError> {
        if let Some(token) = self.fresh_cached() {
            return Ok(token);
        }

        let _refresh = self.refresh_lock.lock().await;

        // Another caller may have refreshed while we waited.
        if let Some(token) = self.fresh_cached() {
            debug!("Using token refreshed by a concurrent caller");
            return Ok(token);
        }

        let token = source.fetch_token().await?;
        if token.token.is_empty() {
            return Err(CredentialError::EmptyToken);
        }

        info!(
            expires_in_secs = token
                .expires_at
                .duration_since(SystemTime::now())
                .map(|d| d.as_secs())
                .unwrap_or(0),
            "Fetched new managed identity token"
        );

        let value = token.token.clone();
        *self.cached.write() = Some(token);
        Ok(value)
    }
}

impl std::fmt::Debug for CredentialProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.mode {
            CredentialMode::Static(_) => "static",
            CredentialMode::ManagedIdentity(_) => "managed_identity",
            CredentialMode::Unconfigured => "unconfigured",
        };
        f.debug_struct("CredentialProvider")
            .field("mode", &mode)
            .field("refresh_threshold", &self.refresh_threshold)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        calls: AtomicUsize,
        lifetime: Duration,
        delay: Duration,
        token: &'static str,
    }

    impl CountingSource {
        fn new(lifetime: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                lifetime,
                delay: Duration::ZERO,
                token: "tok",
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenSource for CountingSource {
        async fn fetch_token(&self) -> Result<AccessToken, CredentialError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(AccessToken {
                token: format!("{}-{}", self.token, n),
                expires_at: SystemTime::now() + self.lifetime,
            })
        }
    }

    #[tokio::test]
    async fn test_static_key_returned_verbatim() {
        let provider = CredentialProvider::static_key("sk-test");
        for _ in 0..3 {
            assert_eq!(
                provider.acquire().await.unwrap(),
                AuthMaterial::ApiKey("sk-test".to_string())
            );
        }
        assert!(provider.is_static());
    }

    #[tokio::test]
    async fn test_unconfigured_fails() {
        let provider = CredentialProvider::unconfigured();
        assert!(matches!(
            provider.acquire().await,
            Err(CredentialError::NotConfigured)
        ));
    }

    #[tokio::test]
    async fn test_fresh_token_is_cached() {
        let source = Arc::new(CountingSource::new(Duration::from_secs(10 * 60)));
        let provider = CredentialProvider::managed_identity(source.clone());

        let first = provider.acquire().await.unwrap();
        let second = provider.acquire().await.unwrap();

        assert_eq!(first, AuthMaterial::BearerToken("tok-1".to_string()));
        assert_eq!(first, second);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_token_inside_threshold_is_refreshed() {
        // four minutes left is inside the five minute threshold
        let source = Arc::new(CountingSource::new(Duration::from_secs(4 * 60)));
        let provider = CredentialProvider::managed_identity(source.clone());

        assert_eq!(provider.acquire().await.unwrap().secret(), "tok-1");
        assert_eq!(provider.acquire().await.unwrap().secret(), "tok-2");
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_custom_threshold() {
        let source = Arc::new(CountingSource::new(Duration::from_secs(4 * 60)));
        let provider = CredentialProvider::managed_identity(source.clone())
            .with_refresh_threshold(Duration::from_secs(60));

        provider.acquire().await.unwrap();
        provider.acquire().await.unwrap();
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_acquires_share_one_refresh() {
        let mut source = CountingSource::new(Duration::from_secs(3600));
        source.delay = Duration::from_millis(50);
        let source = Arc::new(source);
        let provider = Arc::new(CredentialProvider::managed_identity(source.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let provider = provider.clone();
                tokio::spawn(async move { provider.acquire().await })
            })
            .collect();

        for handle in handles {
            let auth = handle.await.unwrap().unwrap();
            assert_eq!(auth.secret(), "tok-1");
        }
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_empty_token_is_rejected() {
        struct EmptySource;

        #[async_trait]
        impl TokenSource for EmptySource {
            async fn fetch_token(&self) -> Result<AccessToken, CredentialError> {
                Ok(AccessToken {
                    token: String::new(),
                    expires_at: SystemTime::now() + Duration::from_secs(3600),
                })
            }
        }

        let provider = CredentialProvider::managed_identity(Arc::new(EmptySource));
        assert!(matches!(
            provider.acquire().await,
            Err(CredentialError::EmptyToken)
        ));
    }

    #[test]
    fn test_identity_response_string_expiry() {
        let json = r#"{"access_token": "abc", "expires_on": "4102444800", "token_type": "Bearer"}"#;
        let response: IdentityTokenResponse = serde_json::from_str(json).unwrap();
        let token = response.into_access_token().unwrap();
        assert_eq!(token.token, "abc");
        assert_eq!(token.expires_at, UNIX_EPOCH + Duration::from_secs(4_102_444_800));
    }

    #[test]
    fn test_identity_response_numeric_expires_in() {
        let json = r#"{"access_token": "abc", "expires_in": 3600}"#;
        let response: IdentityTokenResponse = serde_json::from_str(json).unwrap();
        let token = response.into_access_token().unwrap();
        assert!(token.is_fresh(Duration::from_secs(3000)));
    }

    #[test]
    fn test_identity_response_without_token() {
        let json = r#"{"expires_in": 3600}"#;
        let response: IdentityTokenResponse = serde_json::from_str(json).unwrap();
        assert!(matches!(
            response.into_access_token(),
            Err(CredentialError::EmptyToken)
        ));
    }

    #[test]
    fn test_identity_response_expiry_out_of_range() {
        let json = r#"{"access_token": "abc", "expires_in": "18446744073709551615"}"#;
        let response: IdentityTokenResponse = serde_json::from_str(json).unwrap();
        match response.into_access_token() {
            Err(CredentialError::ProviderRequest(message)) => {
                assert!(message.contains("out of range"));
            }
            other => panic!("Expected ProviderRequest error, got {other:?}"),
        }

        let json = r#"{"access_token": "abc", "expires_on": 18446744073709551615}"#;
        let response: IdentityTokenResponse = serde_json::from_str(json).unwrap();
        assert!(matches!(
            response.into_access_token(),
            Err(CredentialError::ProviderRequest(_))
        ));
    }

    #[test]
    fn test_auth_material_debug_hides_secret() {
        let auth = AuthMaterial::ApiKey("sk-secret".to_string());
        assert!(!format!("{auth:?}").contains("sk-secret"));
    }
}

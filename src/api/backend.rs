//! Transport for the identity endpoints.
//!
//! Login, refresh, profile resolution, and revocation travel on this
//! separate path rather than through `ApiClient`, so a failing refresh call
//! can never re-enter the refresh coordinator.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::auth::UserProfile;

use super::ApiError;

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
pub(crate) const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Token pair as issued by `/auth/login` and `/auth/refresh`.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    /// Lifetime of the access token in seconds
    pub expires_in: i64,
}

/// Identity-provider operations needed by the session layer.
/// Implemented over HTTP in production and stubbed in tests.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Exchange a username and password for a token pair
    async fn login(&self, username: &str, password: &str) -> Result<TokenGrant, ApiError>;

    /// Exchange a refresh token for a new token pair
    async fn refresh_tokens(&self, refresh_token: &str) -> Result<TokenGrant, ApiError>;

    /// Resolve the profile behind an access token
    async fn fetch_profile(&self, access_token: &str) -> Result<UserProfile, ApiError>;

    /// Revoke a refresh token
    async fn revoke(&self, refresh_token: &str) -> Result<(), ApiError>;
}

/// `AuthBackend` over HTTP.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpAuthBackend {
    client: Client,
    base_url: String,
}

impl HttpAuthBackend {
    /// Create a backend with its own connection pool
    pub fn new(base_url: impl Into<String>) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self::with_client(client, base_url))
    }

    /// Create a backend sharing an existing connection pool
    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Check if a response is successful, returning an error with body if not
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }
}

#[async_trait]
impl AuthBackend for HttpAuthBackend {
    async fn login(&self, username: &str, password: &str) -> Result<TokenGrant, ApiError> {
        debug!(username, "Authenticating");
        let response = self
            .client
            .post(self.url("/auth/login"))
            .form(&[("username", username), ("password", password)])
            .send()
            .await?;

        let response = Self::check_response(response).await?;
        let grant = response
            .json()
            .await
            .map_err(|err| ApiError::InvalidResponse(format!("Bad login response: {}", err)))?;
        Ok(grant)
    }

    async fn refresh_tokens(&self, refresh_token: &str) -> Result<TokenGrant, ApiError> {
        let response = self
            .client
            .post(self.url("/auth/refresh"))
            .json(&serde_json::json!({ "refresh_token": refresh_token }))
            .send()
            .await?;

        let response = Self::check_response(response).await?;
        let grant = response
            .json()
            .await
            .map_err(|err| ApiError::InvalidResponse(format!("Bad refresh response: {}", err)))?;
        Ok(grant)
    }

    async fn fetch_profile(&self, access_token: &str) -> Result<UserProfile, ApiError> {
        let response = self
            .client
            .get(self.url("/auth/me"))
            .bearer_auth(access_token)
            .send()
            .await?;

        let response = Self::check_response(response).await?;
        let profile = response
            .json()
            .await
            .map_err(|err| ApiError::InvalidResponse(format!("Bad profile response: {}", err)))?;
        Ok(profile)
    }

    async fn revoke(&self, refresh_token: &str) -> Result<(), ApiError> {
        let response = self
            .client
            .post(self.url("/auth/logout"))
            .json(&serde_json::json!({ "refresh_token": refresh_token }))
            .send()
            .await?;

        Self::check_response(response).await?;
        Ok(())
    }
}

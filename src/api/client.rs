//! Authenticated API client.
//!
//! Every outgoing call reads the current access token from the session store
//! at the moment it is dispatched and attaches it as a bearer credential. On
//! a 401 the client runs one refresh-and-resubmit cycle through the
//! `RefreshCoordinator`; the retry marker on the request context guarantees
//! no call is ever resubmitted twice.

use std::sync::Arc;

use reqwest::{Client, Method};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::auth::{RefreshCoordinator, SessionStore};

use super::backend::REQUEST_TIMEOUT_SECS;
use super::ApiError;

/// Per-call metadata carried across resubmission.
///
/// `retried` is set once the call has been resubmitted after a refresh; a
/// call whose marker is set is never resubmitted again, even if it fails
/// authentication a second time.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestContext {
    pub retried: bool,
}

/// API client for the CivicDesk portal.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    session: Arc<SessionStore>,
    refresher: Arc<RefreshCoordinator>,
}

impl ApiClient {
    /// Create a client with its own connection pool
    pub fn new(
        base_url: impl Into<String>,
        session: Arc<SessionStore>,
        refresher: Arc<RefreshCoordinator>,
    ) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self::with_client(client, base_url, session, refresher))
    }

    /// Create a client sharing an existing connection pool
    pub fn with_client(
        client: Client,
        base_url: impl Into<String>,
        session: Arc<SessionStore>,
        refresher: Arc<RefreshCoordinator>,
    ) -> Self {
        let base_url = base_url.into();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            session,
            refresher,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self
            .execute(Method::GET, path, None, RequestContext::default())
            .await?;
        Self::parse_json(path, response).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let body = Self::encode_body(body)?;
        let response = self
            .execute(Method::POST, path, Some(body), RequestContext::default())
            .await?;
        Self::parse_json(path, response).await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let body = Self::encode_body(body)?;
        let response = self
            .execute(Method::PUT, path, Some(body), RequestContext::default())
            .await?;
        Self::parse_json(path, response).await
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.execute(Method::DELETE, path, None, RequestContext::default())
            .await?;
        Ok(())
    }

    /// Change the account password, then drop the pending-reset flag from the
    /// cached profile so the route guard stops forcing the change screen.
    pub async fn change_password(
        &self,
        current_password: &str,
        new_password: &str,
    ) -> Result<(), ApiError> {
        let body = serde_json::json!({
            "current_password": current_password,
            "new_password": new_password,
        });
        self.execute(
            Method::POST,
            "/auth/change-password",
            Some(body),
            RequestContext::default(),
        )
        .await?;

        if let Some(mut user) = self.session.user() {
            if user.must_reset_password {
                user.must_reset_password = false;
                if let Err(err) = self.session.set_user(user) {
                    warn!(error = %err, "Failed to persist cleared password-reset flag");
                }
            }
        }
        Ok(())
    }

    /// Dispatch a call, refreshing credentials and resubmitting at most once.
    ///
    /// 401 with the retry marker unset runs one refresh cycle; 401 with the
    /// marker set and 403 anywhere are permanent and clear the session. Every
    /// other status, and transport errors, pass through with the session
    /// untouched.
    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        mut ctx: RequestContext,
    ) -> Result<reqwest::Response, ApiError> {
        let url = format!("{}{}", self.base_url, path);

        loop {
            // Read the token at dispatch time, never cached across retries
            let observed_token = self.session.access_token();

            let mut request = self.client.request(method.clone(), &url);
            if let Some(ref token) = observed_token {
                request = request.bearer_auth(token);
            }
            if let Some(ref body) = body {
                request = request.json(body);
            }

            let response = request.send().await?;
            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            let body_text = response.text().await.unwrap_or_default();
            match ApiError::from_status(status, &body_text) {
                ApiError::Unauthorized if !ctx.retried => {
                    debug!(url = %url, "Unauthorized response, attempting credential refresh");
                    match self.refresher.refresh(observed_token.as_deref()).await {
                        Ok(()) => {
                            ctx.retried = true;
                            continue;
                        }
                        Err(err) => {
                            // The coordinator already cleared the session;
                            // surface the caller's original failure.
                            debug!(error = %err, "Refresh failed, surfacing original error");
                            return Err(ApiError::Unauthorized);
                        }
                    }
                }
                ApiError::Unauthorized => {
                    warn!(url = %url, "Resubmitted call failed authentication again, clearing session");
                    if let Err(err) = self.session.clear() {
                        warn!(error = %err, "Failed to clear session");
                    }
                    return Err(ApiError::Unauthorized);
                }
                ApiError::Forbidden(body_text) => {
                    warn!(url = %url, "Permission denied, clearing session");
                    if let Err(err) = self.session.clear() {
                        warn!(error = %err, "Failed to clear session");
                    }
                    return Err(ApiError::Forbidden(body_text));
                }
                other => return Err(other),
            }
        }
    }

    fn encode_body<B: Serialize>(body: &B) -> Result<Value, ApiError> {
        serde_json::to_value(body)
            .map_err(|err| ApiError::InvalidResponse(format!("Failed to encode request body: {}", err)))
    }

    async fn parse_json<T: DeserializeOwned>(
        path: &str,
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        response.json().await.map_err(|err| {
            ApiError::InvalidResponse(format!("Failed to parse response from {}: {}", path, err))
        })
    }
}

//! Session lifecycle orchestration: boot-time hydration, login, logout.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::api::AuthBackend;

use super::{CredentialStore, RefreshCoordinator, SessionStore, UserProfile};

pub struct SessionManager {
    session: Arc<SessionStore>,
    backend: Arc<dyn AuthBackend>,
    refresher: Arc<RefreshCoordinator>,
}

impl SessionManager {
    pub fn new(
        session: Arc<SessionStore>,
        backend: Arc<dyn AuthBackend>,
        refresher: Arc<RefreshCoordinator>,
    ) -> Self {
        Self {
            session,
            backend,
            refresher,
        }
    }

    /// Restore the session at application start.
    ///
    /// Hydrates from durable storage, refreshes a pair that is already at or
    /// near expiry, and resolves the user profile if none was cached. A
    /// persisted credential that fails profile resolution is treated as
    /// invalid and the whole session is cleared.
    pub async fn bootstrap(&self) -> Result<()> {
        if !self.session.hydrate()? {
            debug!("No persisted session to restore");
            return Ok(());
        }

        if let Some(tokens) = self.session.tokens() {
            if tokens.needs_refresh() {
                debug!("Persisted credentials near expiry, refreshing before use");
                if self.refresher.refresh(Some(&tokens.access_token)).await.is_err() {
                    // The coordinator cleared the session; nothing to restore.
                    return Ok(());
                }
            }
        }

        if self.session.user().is_some() {
            info!("Session restored from storage");
            return Ok(());
        }

        let Some(access_token) = self.session.access_token() else {
            return Ok(());
        };
        match self.backend.fetch_profile(&access_token).await {
            Ok(profile) => {
                self.session.set_user(profile)?;
                info!("Session restored from storage");
            }
            Err(err) => {
                warn!(error = %err, "Persisted credentials failed profile resolution, clearing session");
                self.session.clear()?;
            }
        }
        Ok(())
    }

    /// Authenticate, store the issued token pair, and cache the profile.
    /// With `remember` set, the secret is kept in the OS keychain for
    /// `remembered_login`.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        remember: bool,
    ) -> Result<UserProfile> {
        let grant = self
            .backend
            .login(username, password)
            .await
            .context("Login failed")?;
        let access_token = grant.access_token.clone();
        self.session.set_tokens(grant)?;

        let profile = match self.backend.fetch_profile(&access_token).await {
            Ok(profile) => profile,
            Err(err) => {
                // A credential we cannot resolve a profile for is useless;
                // don't leave it lying around.
                self.session.clear()?;
                return Err(err).context("Profile resolution failed after login");
            }
        };
        self.session.set_user(profile.clone())?;

        if remember {
            if let Err(err) = CredentialStore::store(username, password) {
                warn!(error = %err, "Failed to store credentials in keychain");
            }
        }

        info!(username, "Logged in");
        Ok(profile)
    }

    /// Log in with a secret previously stored via `login(.., remember=true)`
    pub async fn remembered_login(&self, username: &str) -> Result<UserProfile> {
        let password = CredentialStore::retrieve(username)?;
        self.login(username, &password, false).await
    }

    /// Revoke the refresh token (best effort) and clear the session
    pub async fn logout(&self) -> Result<()> {
        if let Some(refresh_token) = self.session.refresh_token() {
            if let Err(err) = self.backend.revoke(&refresh_token).await {
                warn!(error = %err, "Token revocation failed, clearing local session anyway");
            }
        }
        self.session.clear()?;
        info!("Logged out");
        Ok(())
    }
}

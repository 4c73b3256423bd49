//! Wiring for the session subsystem.
//!
//! `Portal` constructs the session store, identity backend, refresh
//! coordinator, API client, and session manager from one `Config`, sharing a
//! single connection pool across all of them.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use reqwest::Client;
use tracing::warn;

use crate::api::{ApiClient, AuthBackend, HttpAuthBackend};
use crate::auth::{
    CredentialStore, RefreshCoordinator, SessionManager, SessionStore, UserProfile,
};
use crate::config::Config;
use crate::routes::{self, Destination, RouteDecision};

pub struct Portal {
    config: Config,
    session: Arc<SessionStore>,
    client: ApiClient,
    manager: SessionManager,
}

impl Portal {
    pub fn new(config: Config) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(
                crate::api::backend::REQUEST_TIMEOUT_SECS,
            ))
            .build()?;
        let base_url = config.api_base_url().to_string();

        let session = Arc::new(SessionStore::new(config.data_dir()?));
        let backend: Arc<dyn AuthBackend> =
            Arc::new(HttpAuthBackend::with_client(http.clone(), base_url.clone()));
        let refresher = Arc::new(RefreshCoordinator::new(session.clone(), backend.clone()));
        let client = ApiClient::with_client(http, base_url, session.clone(), refresher.clone());
        let manager = SessionManager::new(session.clone(), backend, refresher);

        Ok(Self {
            config,
            session,
            client,
            manager,
        })
    }

    /// Hydrate and validate the persisted session at application start
    pub async fn bootstrap(&self) -> Result<()> {
        self.manager.bootstrap().await
    }

    /// Authenticate; with `remember` set, the secret goes to the OS keychain
    /// and the username is persisted in the config for the next start.
    pub async fn login(
        &mut self,
        username: &str,
        password: &str,
        remember: bool,
    ) -> Result<UserProfile> {
        let profile = self.manager.login(username, password, remember).await?;
        if remember {
            self.config.last_username = Some(username.to_string());
            if let Err(err) = self.config.save() {
                warn!(error = %err, "Failed to persist remembered username");
            }
        }
        Ok(profile)
    }

    /// Log back in as the remembered user
    pub async fn remembered_login(&self) -> Result<UserProfile> {
        let username = self
            .config
            .last_username
            .clone()
            .ok_or_else(|| anyhow!("No remembered username"))?;
        self.manager.remembered_login(&username).await
    }

    /// Drop the remembered username and its keychain secret
    pub fn forget_remembered(&mut self) {
        let Some(username) = self.config.last_username.take() else {
            return;
        };
        if let Err(err) = CredentialStore::delete(&username) {
            warn!(error = %err, "Failed to remove remembered secret from keychain");
        }
        if let Err(err) = self.config.save() {
            warn!(error = %err, "Failed to persist config after forgetting user");
        }
    }

    /// Gate a navigation attempt against the current session state
    pub fn guard(&self, destination: &Destination) -> RouteDecision {
        routes::evaluate(&self.session.snapshot(), destination)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn session(&self) -> &Arc<SessionStore> {
        &self.session
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }
}

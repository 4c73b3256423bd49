//! In-memory session state with synchronous durable persistence.
//!
//! The `SessionStore` owns the current token pair and cached user profile.
//! Every mutation updates memory first and then rewrites the persisted copy,
//! so a restart resumes the same session via `hydrate()`.

use std::path::PathBuf;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::api::TokenGrant;

/// Session file name in the data directory
const SESSION_FILE: &str = "session.json";

/// Buffer before expiry after which a token is refreshed proactively.
/// 30 seconds covers clock skew and request latency.
const REFRESH_SKEW_SECONDS: i64 = 30;

/// Role assigned to a portal account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Staff,
    Admin,
}

impl Role {
    /// Whether this role grants access to something requiring `required`.
    /// Admin accounts hold every staff permission.
    pub fn satisfies(self, required: Role) -> bool {
        match (self, required) {
            (Role::Admin, _) => true,
            (Role::Staff, Role::Staff) => true,
            (Role::Staff, Role::Admin) => false,
        }
    }
}

/// Authenticated user profile as returned by `/auth/me`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: i64,
    pub display_name: String,
    pub role: Role,
    #[serde(default)]
    pub must_reset_password: bool,
}

/// Access/refresh token pair with its absolute expiry.
/// Replaced atomically by the store, never mutated in place.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl TokenPair {
    /// Build a pair from a grant, resolving `expires_in` to an absolute instant
    pub fn from_grant(grant: TokenGrant) -> Self {
        Self {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
            expires_at: Utc::now() + Duration::seconds(grant.expires_in),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Check if the pair is close enough to expiry to refresh before use
    pub fn needs_refresh(&self) -> bool {
        Utc::now() > self.expires_at - Duration::seconds(REFRESH_SKEW_SECONDS)
    }
}

/// Snapshot of the current session state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    pub tokens: Option<TokenPair>,
    pub user: Option<UserProfile>,
}

/// On-disk layout: `{accessToken, refreshToken, expiresAt (epoch ms), user?}`
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedSession {
    #[serde(skip_serializing_if = "Option::is_none")]
    access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user: Option<UserProfile>,
}

impl PersistedSession {
    fn from_session(session: &Session) -> Self {
        Self {
            access_token: session.tokens.as_ref().map(|t| t.access_token.clone()),
            refresh_token: session.tokens.as_ref().map(|t| t.refresh_token.clone()),
            expires_at: session.tokens.as_ref().map(|t| t.expires_at),
            user: session.user.clone(),
        }
    }

    fn into_session(self) -> Session {
        let tokens = match (self.access_token, self.refresh_token, self.expires_at) {
            (Some(access_token), Some(refresh_token), Some(expires_at)) => Some(TokenPair {
                access_token,
                refresh_token,
                expires_at,
            }),
            _ => None,
        };
        Session {
            tokens,
            user: self.user,
        }
    }
}

/// Process-wide session state, constructed explicitly so tests can substitute
/// their own instance backed by a scratch directory.
#[derive(Debug)]
pub struct SessionStore {
    path: PathBuf,
    inner: RwLock<Session>,
}

impl SessionStore {
    /// Create an empty store persisting to `data_dir/session.json`
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            path: data_dir.join(SESSION_FILE),
            inner: RwLock::new(Session::default()),
        }
    }

    /// Load a previously persisted session into memory.
    /// Missing or malformed files are treated as no session at all.
    /// Returns whether a session was restored.
    pub fn hydrate(&self) -> Result<bool> {
        if !self.path.exists() {
            return Ok(false);
        }
        let contents = std::fs::read_to_string(&self.path)
            .context("Failed to read persisted session")?;
        let persisted: PersistedSession = match serde_json::from_str(&contents) {
            Ok(persisted) => persisted,
            Err(err) => {
                warn!(error = %err, "Persisted session is malformed, ignoring it");
                return Ok(false);
            }
        };
        let session = persisted.into_session();
        if session.tokens.is_none() {
            return Ok(false);
        }
        debug!("Hydrated persisted session");
        *self.write() = session;
        Ok(true)
    }

    /// Replace the token pair, computing and storing its absolute expiry
    pub fn set_tokens(&self, grant: TokenGrant) -> Result<()> {
        let snapshot = {
            let mut session = self.write();
            session.tokens = Some(TokenPair::from_grant(grant));
            session.clone()
        };
        self.persist(&snapshot)
    }

    /// Replace the cached user profile, preserving tokens
    pub fn set_user(&self, user: UserProfile) -> Result<()> {
        let snapshot = {
            let mut session = self.write();
            session.user = Some(user);
            session.clone()
        };
        self.persist(&snapshot)
    }

    /// Remove tokens, profile, and the persisted copy. Idempotent.
    pub fn clear(&self) -> Result<()> {
        *self.write() = Session::default();
        if self.path.exists() {
            std::fs::remove_file(&self.path).context("Failed to remove persisted session")?;
        }
        Ok(())
    }

    /// Current access token, read synchronously at dispatch time
    pub fn access_token(&self) -> Option<String> {
        self.read().tokens.as_ref().map(|t| t.access_token.clone())
    }

    /// Current refresh token
    pub fn refresh_token(&self) -> Option<String> {
        self.read().tokens.as_ref().map(|t| t.refresh_token.clone())
    }

    /// Current token pair
    pub fn tokens(&self) -> Option<TokenPair> {
        self.read().tokens.clone()
    }

    /// Cached user profile
    pub fn user(&self) -> Option<UserProfile> {
        self.read().user.clone()
    }

    /// Full snapshot for route-guard evaluation
    pub fn snapshot(&self) -> Session {
        self.read().clone()
    }

    /// Whether both tokens and a resolved profile are present
    pub fn is_authenticated(&self) -> bool {
        let session = self.read();
        session.tokens.is_some() && session.user.is_some()
    }

    fn persist(&self, session: &Session) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let persisted = PersistedSession::from_session(session);
        let contents = serde_json::to_string_pretty(&persisted)?;
        std::fs::write(&self.path, contents).context("Failed to persist session")?;
        Ok(())
    }

    // A poisoned lock only means a writer panicked mid-update; the session
    // data itself is still a consistent snapshot, so recover it.
    fn read(&self) -> RwLockReadGuard<'_, Session> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Session> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

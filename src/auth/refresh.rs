//! Single-flight credential refresh.
//!
//! When many calls fail with an authentication error in the same expiry
//! window, exactly one `/auth/refresh` network call may be issued. The first
//! failing caller starts the refresh and records its handle; every caller
//! arriving while it is in flight awaits that same handle. A failed refresh
//! clears the session for everyone.

use std::sync::{Arc, Mutex, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::{ApiError, AuthBackend};

use super::SessionStore;

/// Why a refresh attempt did not produce new credentials.
///
/// Clone so the same settled result can be handed to every caller awaiting
/// the shared in-flight refresh.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefreshError {
    #[error("no refresh token available")]
    NoRefreshToken,

    #[error("refresh rejected by the identity provider: {0}")]
    Rejected(String),

    #[error("network failure during refresh: {0}")]
    Network(String),
}

impl From<ApiError> for RefreshError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Network(inner) => RefreshError::Network(inner.to_string()),
            other => RefreshError::Rejected(other.to_string()),
        }
    }
}

/// Handle to the refresh operation currently in flight, if any.
/// `None` means the coordinator is idle.
type PendingRefresh = Shared<BoxFuture<'static, Result<(), RefreshError>>>;

/// What a caller entering `refresh` should do, decided under the lock.
enum Plan {
    /// Await the refresh another caller already started
    Join(PendingRefresh),
    /// Start a refresh, await it, and clear the slot when it settles
    Lead(PendingRefresh),
    /// The stored token already changed since the caller's failed dispatch,
    /// so this expiry window was serviced by someone else
    AlreadyFresh,
}

pub struct RefreshCoordinator {
    session: Arc<SessionStore>,
    backend: Arc<dyn AuthBackend>,
    pending: Mutex<Option<PendingRefresh>>,
}

impl RefreshCoordinator {
    pub fn new(session: Arc<SessionStore>, backend: Arc<dyn AuthBackend>) -> Self {
        Self {
            session,
            backend,
            pending: Mutex::new(None),
        }
    }

    /// Obtain fresh credentials for a caller whose dispatch with
    /// `stale_token` was rejected as unauthorized.
    ///
    /// Returns `Ok` once the session store holds a newer token pair, whether
    /// this caller led the refresh or waited on one. On any failure the
    /// session has been cleared and the caller should surface its original
    /// authentication error.
    pub async fn refresh(&self, stale_token: Option<&str>) -> Result<(), RefreshError> {
        let plan = {
            let mut pending = self.lock_pending();
            if let Some(inflight) = pending.as_ref() {
                Plan::Join(inflight.clone())
            } else if self.window_already_serviced(stale_token) {
                Plan::AlreadyFresh
            } else {
                let fut = Self::run_refresh(self.session.clone(), self.backend.clone())
                    .boxed()
                    .shared();
                *pending = Some(fut.clone());
                Plan::Lead(fut)
            }
        };

        match plan {
            Plan::AlreadyFresh => {
                debug!("Credentials already rotated for this window, skipping refresh");
                Ok(())
            }
            Plan::Join(inflight) => inflight.await,
            Plan::Lead(inflight) => {
                let result = inflight.await;
                // Release the slot on both exit paths so no caller can ever
                // observe a stuck in-flight handle.
                *self.lock_pending() = None;
                result
            }
        }
    }

    /// Whether a refresh network call is currently outstanding
    pub fn is_refreshing(&self) -> bool {
        self.lock_pending().is_some()
    }

    /// A caller's 401 is outdated if the store already holds a different
    /// access token than the one that was rejected.
    fn window_already_serviced(&self, stale_token: Option<&str>) -> bool {
        match (stale_token, self.session.access_token()) {
            (Some(stale), Some(current)) => stale != current,
            _ => false,
        }
    }

    /// The single refresh network call shared by every waiting caller.
    /// Session store writes happen here, exactly once per flight.
    async fn run_refresh(
        session: Arc<SessionStore>,
        backend: Arc<dyn AuthBackend>,
    ) -> Result<(), RefreshError> {
        let Some(refresh_token) = session.refresh_token() else {
            debug!("No refresh token available, invalidating session");
            if let Err(err) = session.clear() {
                warn!(error = %err, "Failed to clear session");
            }
            return Err(RefreshError::NoRefreshToken);
        };

        debug!("Refreshing credentials");
        match backend.refresh_tokens(&refresh_token).await {
            Ok(grant) => {
                if let Err(err) = session.set_tokens(grant) {
                    // In-memory tokens are updated even if the durable copy
                    // could not be written; the session survives until restart.
                    warn!(error = %err, "Failed to persist refreshed session");
                }
                info!("Credentials refreshed");
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "Credential refresh failed, clearing session");
                if let Err(clear_err) = session.clear() {
                    warn!(error = %clear_err, "Failed to clear session");
                }
                Err(RefreshError::from(err))
            }
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Option<PendingRefresh>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    use crate::api::TokenGrant;
    use crate::auth::UserProfile;

    use super::*;

    /// Backend stub whose refresh call blocks until the test releases it,
    /// so concurrent callers can pile up behind the in-flight handle.
    struct StubBackend {
        refresh_calls: AtomicUsize,
        gate: Semaphore,
        fail: bool,
    }

    impl StubBackend {
        fn new(fail: bool) -> Self {
            Self {
                refresh_calls: AtomicUsize::new(0),
                gate: Semaphore::new(0),
                fail,
            }
        }

        fn release(&self) {
            self.gate.add_permits(1);
        }

        fn calls(&self) -> usize {
            self.refresh_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AuthBackend for StubBackend {
        async fn login(&self, _: &str, _: &str) -> Result<TokenGrant, ApiError> {
            unimplemented!("not exercised")
        }

        async fn refresh_tokens(&self, _refresh_token: &str) -> Result<TokenGrant, ApiError> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            // Each release() admits exactly one call
            self.gate.acquire().await.unwrap().forget();
            if self.fail {
                Err(ApiError::Forbidden("revoked".to_string()))
            } else {
                Ok(TokenGrant {
                    access_token: "a2".to_string(),
                    refresh_token: "r2".to_string(),
                    expires_in: 3600,
                })
            }
        }

        async fn fetch_profile(&self, _: &str) -> Result<UserProfile, ApiError> {
            unimplemented!("not exercised")
        }

        async fn revoke(&self, _: &str) -> Result<(), ApiError> {
            unimplemented!("not exercised")
        }
    }

    fn seeded_store(dir: &tempfile::TempDir) -> Arc<SessionStore> {
        let store = Arc::new(SessionStore::new(dir.path().to_path_buf()));
        store
            .set_tokens(TokenGrant {
                access_token: "a1".to_string(),
                refresh_token: "r1".to_string(),
                expires_in: 3600,
            })
            .unwrap();
        store
    }

    /// Yield until the coordinator's leader is parked on the backend call
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_concurrent_failures_share_one_refresh_call() {
        let dir = tempfile::tempdir().unwrap();
        let session = seeded_store(&dir);
        let backend = Arc::new(StubBackend::new(false));
        let coordinator = Arc::new(RefreshCoordinator::new(session.clone(), backend.clone()));

        let waiters = futures::future::join_all((0..3).map(|_| {
            let coordinator = coordinator.clone();
            async move { coordinator.refresh(Some("a1")).await }
        }));
        let release = async {
            settle().await;
            assert!(coordinator.is_refreshing());
            assert_eq!(backend.calls(), 1);
            backend.release();
        };

        let (results, _) = tokio::join!(waiters, release);
        assert_eq!(backend.calls(), 1);
        assert!(results.iter().all(|r| r.is_ok()));
        assert!(!coordinator.is_refreshing());
        assert_eq!(session.access_token().as_deref(), Some("a2"));
        assert_eq!(session.refresh_token().as_deref(), Some("r2"));
    }

    #[tokio::test]
    async fn test_failed_refresh_rejects_every_waiter_and_clears_session() {
        let dir = tempfile::tempdir().unwrap();
        let session = seeded_store(&dir);
        let backend = Arc::new(StubBackend::new(true));
        let coordinator = Arc::new(RefreshCoordinator::new(session.clone(), backend.clone()));

        let waiters = futures::future::join_all((0..3).map(|_| {
            let coordinator = coordinator.clone();
            async move { coordinator.refresh(Some("a1")).await }
        }));
        let release = async {
            settle().await;
            backend.release();
        };

        let (results, _) = tokio::join!(waiters, release);
        assert_eq!(backend.calls(), 1);
        assert!(results
            .iter()
            .all(|r| matches!(r, Err(RefreshError::Rejected(_)))));
        assert!(session.tokens().is_none());
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn test_missing_refresh_token_skips_network_io() {
        let dir = tempfile::tempdir().unwrap();
        let session = Arc::new(SessionStore::new(dir.path().to_path_buf()));
        let backend = Arc::new(StubBackend::new(false));
        let coordinator = RefreshCoordinator::new(session.clone(), backend.clone());

        let result = coordinator.refresh(None).await;
        assert_eq!(result, Err(RefreshError::NoRefreshToken));
        assert_eq!(backend.calls(), 0);
        assert!(session.tokens().is_none());
    }

    #[tokio::test]
    async fn test_stale_failure_after_rotation_does_not_refresh_again() {
        let dir = tempfile::tempdir().unwrap();
        let session = seeded_store(&dir);
        let backend = Arc::new(StubBackend::new(false));
        let coordinator = RefreshCoordinator::new(session.clone(), backend.clone());

        // A call that was dispatched with "a0" before the current pair was
        // stored: its window has already been serviced.
        let result = coordinator.refresh(Some("a0")).await;
        assert_eq!(result, Ok(()));
        assert_eq!(backend.calls(), 0);
        assert_eq!(session.access_token().as_deref(), Some("a1"));
    }

    #[tokio::test]
    async fn test_sequential_windows_each_get_their_own_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let session = seeded_store(&dir);
        let backend = Arc::new(StubBackend::new(false));
        let coordinator = RefreshCoordinator::new(session.clone(), backend.clone());

        backend.release();
        coordinator.refresh(Some("a1")).await.unwrap();
        assert_eq!(backend.calls(), 1);

        // The rotated pair expires in turn.
        backend.release();
        coordinator.refresh(Some("a2")).await.unwrap();
        assert_eq!(backend.calls(), 2);
    }
}

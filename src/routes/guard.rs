//! Navigation gating based on the current session snapshot.
//!
//! Each navigation attempt is reduced to exactly one `AccessState`, computed
//! once and matched exhaustively, so the four outcomes are exclusive and
//! testable in isolation.

use crate::auth::{Role, Session};

/// The change-password screen, exempt from the pending-reset redirect
pub const CHANGE_PASSWORD_PATH: &str = "/change-password";

/// A navigation target and the role it requires, if any.
/// `required_role: None` means any authenticated user may enter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub path: String,
    pub required_role: Option<Role>,
}

impl Destination {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            required_role: None,
        }
    }

    pub fn with_role(path: impl Into<String>, role: Role) -> Self {
        Self {
            path: path.into(),
            required_role: Some(role),
        }
    }

    fn is_change_password(&self) -> bool {
        self.path == CHANGE_PASSWORD_PATH
    }
}

/// Why a navigation is or is not allowed, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessState {
    Unauthenticated,
    MustResetPassword,
    RoleMismatch,
    Authorized,
}

/// Where a navigation attempt should actually land.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    Allow,
    /// Login screen, remembering the originally requested destination
    RedirectToLogin { resume: String },
    RedirectToChangePassword,
    RedirectToDefault,
}

/// Classify a navigation attempt against the session snapshot
pub fn access_state(session: &Session, destination: &Destination) -> AccessState {
    let Some(user) = session.user.as_ref() else {
        return AccessState::Unauthenticated;
    };
    if user.must_reset_password && !destination.is_change_password() {
        return AccessState::MustResetPassword;
    }
    if let Some(required) = destination.required_role {
        if !user.role.satisfies(required) {
            return AccessState::RoleMismatch;
        }
    }
    AccessState::Authorized
}

/// Evaluate a navigation attempt, producing exactly one outcome
pub fn evaluate(session: &Session, destination: &Destination) -> RouteDecision {
    match access_state(session, destination) {
        AccessState::Unauthenticated => RouteDecision::RedirectToLogin {
            resume: destination.path.clone(),
        },
        AccessState::MustResetPassword => RouteDecision::RedirectToChangePassword,
        AccessState::RoleMismatch => RouteDecision::RedirectToDefault,
        AccessState::Authorized => RouteDecision::Allow,
    }
}

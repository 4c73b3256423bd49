//! Authentication module: session state, credential refresh, and lifecycle.
//!
//! This module provides:
//! - `SessionStore`: token pair and profile state with durable persistence
//! - `RefreshCoordinator`: single-flight credential refresh on expiry
//! - `SessionManager`: boot-time hydration plus login/logout flows
//! - `CredentialStore`: remember-me secret storage via the OS keyring

pub mod credentials;
pub mod manager;
pub mod refresh;
pub mod session;

pub use credentials::CredentialStore;
pub use manager::SessionManager;
pub use refresh::{RefreshCoordinator, RefreshError};
pub use session::{Role, Session, SessionStore, TokenPair, UserProfile};

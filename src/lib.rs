//! Client core for CivicDesk, a resident-services portal.
//!
//! This crate holds the portal's session subsystem: the durable session
//! store, the bearer-token API client, the single-flight credential refresh
//! coordinator, and the route guard. Feature code (request forms, rosters,
//! admin panels) consumes these pieces and renders whatever state they
//! expose.

pub mod api;
pub mod auth;
pub mod config;
pub mod portal;
pub mod routes;

pub use api::{ApiClient, ApiError, AuthBackend, HttpAuthBackend, TokenGrant};
pub use auth::{
    CredentialStore, RefreshCoordinator, RefreshError, Role, Session, SessionManager,
    SessionStore, TokenPair, UserProfile,
};
pub use config::Config;
pub use portal::Portal;
pub use routes::{AccessState, Destination, RouteDecision};

//! HTTP layer: typed errors, the identity-endpoint transport, and the
//! authenticated client with its refresh-and-retry loop.
//!
//! All data calls use bearer token authentication; the token is read from
//! the session store at dispatch time, never cached by callers.

pub mod backend;
pub mod client;
pub mod error;

pub use backend::{AuthBackend, HttpAuthBackend, TokenGrant};
pub use client::{ApiClient, RequestContext};
pub use error::ApiError;

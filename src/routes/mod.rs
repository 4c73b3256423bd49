//! Route guarding for the portal's navigation layer.

pub mod guard;

pub use guard::{
    access_state, evaluate, AccessState, Destination, RouteDecision, CHANGE_PASSWORD_PATH,
};

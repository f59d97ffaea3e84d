//! HTTP surface of the control plane.
//!
//! Routes are thin: extract `userId` and payload, call into
//! [`camofox_browser::Core`], and map [`camofox_common::CoreError`] kinds to
//! HTTP statuses at this boundary only.

pub mod auth;
pub mod download_routes;
pub mod respond;
pub mod server;
pub mod session_routes;
pub mod state;
pub mod system_routes;
pub mod tab_routes;

pub use {
    server::{build_app, serve},
    state::AppState,
};

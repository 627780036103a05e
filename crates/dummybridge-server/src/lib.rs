//! dummybridge Server - Axum-based HTTP front-end
//!
//! This crate exposes the credential rendezvous broker over HTTP and serves
//! the embedded login pages.

pub mod http;
pub mod state;

pub use http::{client_identity, create_router};
pub use state::AppState;

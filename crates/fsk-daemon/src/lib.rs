//! fsk-daemon library target.
//!
//! Exposes the router, state and service bootstrap for integration tests.
//! The binary `main.rs` depends on this library target.

pub mod api_types;
pub mod bootstrap;
pub mod routes;
pub mod state;

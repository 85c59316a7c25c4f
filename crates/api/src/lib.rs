#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Patchmap API server library
//!
//! Exposes the route modules and state so integration harnesses can build
//! the router without going through `main`.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use routes::create_router;
pub use state::AppState;

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Shared building blocks for the Patchmap services.
//!
//! Holds the database pool helpers and the core domain types that both the
//! API server and the worker depend on.

pub mod db;
pub mod types;

pub use db::{create_pool, run_migrations};
pub use types::{SponsorshipStatus, ACTIVE_LIKE_STATUSES};

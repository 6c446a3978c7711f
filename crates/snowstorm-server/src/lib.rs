//! Snowstorm Server Library
//!
//! Read-only HTTP surface over the central store: liveness/readiness
//! probes for the deployment platform and aggregate statistics for
//! downstream consumers. All writes happen elsewhere (pipeline and
//! periodic jobs); this server never mutates the store.

pub mod config;
pub mod routes;

pub use config::ServerConfig;
pub use routes::{router, AppState};
